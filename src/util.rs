#[cfg(any(target_os = "linux", target_vendor = "apple"))]
use std::ffi::OsStr;


/// Search the sorted `slice` for the last key less than or equal to
/// `item` and return the index of the first element carrying that key.
///
/// Elements typically describe ranges starting at their key, so an
/// address may be covered by an element whose key is smaller.
pub(crate) fn find_match_or_lower_bound_by_key<T, U, F>(
    slice: &[T],
    item: U,
    mut f: F,
) -> Option<usize>
where
    U: Ord,
    F: FnMut(&T) -> U,
{
    // Number of elements with a key less than or equal to `item`.
    let end = slice.partition_point(|e| f(e) <= item);
    let key = f(slice.get(end.checked_sub(1)?)?);
    let start = slice[..end].partition_point(|e| f(e) < key);
    Some(start)
}

#[cfg(test)]
fn find_match_or_lower_bound<T>(slice: &[T], item: T) -> Option<usize>
where
    T: Copy + Ord,
{
    find_match_or_lower_bound_by_key(slice, item, |e| *e)
}


#[cfg(any(target_os = "linux", target_vendor = "apple"))]
pub(crate) fn bytes_to_os_str(bytes: &[u8]) -> &OsStr {
    use std::os::unix::ffi::OsStrExt as _;

    OsStr::from_bytes(bytes)
}


/// Retrieve an identifier for the calling thread, or `0` if it is the
/// process's main thread.
#[cfg(target_os = "linux")]
pub(crate) fn thread_id() -> u64 {
    // SAFETY: Both system calls are always safe to issue.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let pid = unsafe { libc::getpid() };
    if tid == libc::c_long::from(pid) {
        0
    } else {
        tid as u64
    }
}

#[cfg(target_vendor = "apple")]
pub(crate) fn thread_id() -> u64 {
    // SAFETY: Both functions are always safe to call.
    if unsafe { libc::pthread_main_np() } == 1 {
        0
    } else {
        unsafe { libc::pthread_self() as u64 }
    }
}

#[cfg(windows)]
pub(crate) fn thread_id() -> u64 {
    extern "system" {
        fn GetCurrentThreadId() -> u32;
    }

    // SAFETY: `GetCurrentThreadId` is always safe to call.
    u64::from(unsafe { GetCurrentThreadId() })
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
pub(crate) fn thread_id() -> u64 {
    0
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;


    /// Test that we correctly binary search for a lower bound.
    #[test]
    fn search_lower_bound() {
        let data = [];
        assert_eq!(find_match_or_lower_bound(&data, &0), None);

        let data = [5];
        assert_eq!(find_match_or_lower_bound(&data, 0), None);
        assert_eq!(find_match_or_lower_bound(&data, 4), None);
        assert_eq!(find_match_or_lower_bound(&data, 5), Some(0));
        assert_eq!(find_match_or_lower_bound(&data, 6), Some(0));

        let data = [5, 5, 5];
        assert_eq!(find_match_or_lower_bound(&data, 5), Some(0));

        let data = [4, 5, 5, 5, 5];
        assert_eq!(find_match_or_lower_bound(&data, 5), Some(1));

        let data = [1, 4, 42, 43, 99];
        assert_eq!(find_match_or_lower_bound(&data, 0), None);
        assert_eq!(find_match_or_lower_bound(&data, 1), Some(0));
        assert_eq!(find_match_or_lower_bound(&data, 41), Some(1));
        assert_eq!(find_match_or_lower_bound(&data, 98), Some(3));
        assert_eq!(find_match_or_lower_bound(&data, 1337), Some(4));
    }
}
