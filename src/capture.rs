//! Capturing of raw call stacks.
//!
//! Capturing produces a [`Trace`]: an ordered list of instruction
//! pointers, innermost frame first, without any symbolic knowledge.
//! Frames belonging to this module never show up in a captured trace.

use std::ffi::c_void;
use std::hint::black_box;
use std::ops::Index;
#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "aarch64")))]
use std::ptr;
use std::slice;

use backtrace::Frame;

#[cfg(windows)]
use crate::crash::ExceptionPointers;
use crate::log;
use crate::util::thread_id;
use crate::Addr;
use crate::Error;
use crate::Result;


/// The maximum stack depth that can be captured in one go.
pub const MAX_CAPTURE_DEPTH: usize = 1024;
/// The depth captured by default.
pub const DEFAULT_CAPTURE_DEPTH: usize = 32;


/// A single captured stack frame.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct RawFrame {
    /// The instruction pointer of the frame.
    ///
    /// For all frames but one interrupted by a signal this is a return
    /// address, i.e., it points to the instruction *after* the call.
    pub addr: Addr,
    /// The stack pointer associated with the frame, if known.
    pub frame_ptr: Option<Addr>,
    /// Whether `addr` is the exact address of the instruction that was
    /// executing, as opposed to a return address.
    pub exact: bool,
}

impl RawFrame {
    /// Create a new `RawFrame` for a return address.
    #[inline]
    pub fn new(addr: Addr) -> Self {
        Self {
            addr,
            frame_ptr: None,
            exact: false,
        }
    }

    /// Retrieve the address to use for symbol lookup.
    ///
    /// Return addresses may point past the end of the calling function
    /// (or at the next line), so they are adjusted to fall inside the
    /// call instruction.
    #[inline]
    pub fn lookup_addr(&self) -> Addr {
        if self.exact {
            self.addr
        } else {
            self.addr.saturating_sub(1)
        }
    }

    fn from_frame(frame: &Frame) -> Option<Self> {
        let addr = frame.ip() as Addr;
        if addr == 0 {
            return None
        }

        let sp = frame.sp() as Addr;
        let slf = Self {
            addr,
            frame_ptr: (sp != 0).then_some(sp),
            exact: false,
        };
        Some(slf)
    }
}


/// A captured call stack.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    frames: Vec<RawFrame>,
    max_depth: usize,
    thread_id: u64,
    signal: Option<i32>,
    fault_addr: Option<Addr>,
}

impl Trace {
    /// Create a `Trace` from a list of frames, innermost first.
    ///
    /// This constructor is useful for resolving addresses that were
    /// captured elsewhere.
    pub fn from_frames(frames: Vec<RawFrame>) -> Self {
        Self {
            max_depth: frames.len(),
            frames,
            thread_id: thread_id(),
            signal: None,
            fault_addr: None,
        }
    }

    pub(crate) fn with_signal(mut self, signal: i32, fault_addr: Option<Addr>) -> Self {
        self.signal = Some(signal);
        self.fault_addr = fault_addr;
        self
    }

    /// Retrieve the captured frames, innermost first.
    #[inline]
    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    /// Iterate over the captured frames, innermost first.
    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, RawFrame> {
        self.frames.iter()
    }

    /// The number of captured frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check whether no frames were captured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The maximum depth the trace was captured with.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The identifier of the capturing thread (`0` for the process's
    /// main thread).
    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// The signal that caused the capture, if any.
    #[inline]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// The faulting data address reported along with the signal, if any.
    #[inline]
    pub fn fault_addr(&self) -> Option<Addr> {
        self.fault_addr
    }
}

impl Index<usize> for Trace {
    type Output = RawFrame;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.frames[idx]
    }
}

impl<'trace> IntoIterator for &'trace Trace {
    type Item = &'trace RawFrame;
    type IntoIter = slice::Iter<'trace, RawFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


/// Retrieve the start address of the function a frame belongs to.
#[cfg(not(all(windows, any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn function_start(frame: &Frame) -> Addr {
    frame.symbol_address() as Addr
}

/// Retrieve the start address of the function a frame belongs to.
// `Frame::symbol_address` reports the instruction pointer on Windows,
// so we have to consult the unwind tables ourselves.
#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "aarch64")))]
fn function_start(frame: &Frame) -> Addr {
    #[repr(C)]
    struct RuntimeFunction {
        begin_address: u32,
    }

    extern "system" {
        fn RtlLookupFunctionEntry(
            control_pc: u64,
            image_base: *mut u64,
            history_table: *mut c_void,
        ) -> *const RuntimeFunction;
    }

    let mut base = 0u64;
    // SAFETY: `RtlLookupFunctionEntry` accepts arbitrary addresses and
    //         our out pointer is valid.
    let entry =
        unsafe { RtlLookupFunctionEntry(frame.ip() as u64, &mut base, ptr::null_mut()) };
    if entry.is_null() {
        return 0
    }
    // SAFETY: The pointer was checked to be non-NULL and references an
    //         entry in the module's unwind table.
    let begin = unsafe { (*entry).begin_address };
    (base + u64::from(begin)) as Addr
}

fn walk<F>(synchronized: bool, f: F)
where
    F: FnMut(&Frame) -> bool,
{
    if synchronized {
        let () = backtrace::trace(f);
    } else {
        // SAFETY: The caller is running in a context in which no
        //         concurrent stack walk by this crate can be active
        //         (a signal handler that is about to terminate the
        //         process).
        let () = unsafe { backtrace::trace_unsynchronized(f) };
    }
}

/// Capture frames into `buf`, starting with the caller of the function
/// located at `entry` and skipping `skip` frames on top of that.
///
/// Returns the number of captured frames and whether the frame of
/// `entry` was found.
fn capture_frames(
    entry: Addr,
    skip: usize,
    synchronized: bool,
    buf: &mut [RawFrame],
) -> (usize, bool) {
    let mut found = false;
    let mut skipped = 0;
    let mut count = 0;

    let () = walk(synchronized, |frame| {
        if !found {
            found = function_start(frame) == entry;
            return true
        }

        if skipped < skip {
            skipped += 1;
            return true
        }

        match (RawFrame::from_frame(frame), buf.get_mut(count)) {
            (Some(raw), Some(slot)) => {
                *slot = raw;
                count += 1;
                count < buf.len()
            }
            _ => false,
        }
    });

    if found {
        return (count, true)
    }

    // We were unable to recognize our own frame. Report everything we
    // got minus the skipped frames, which is the best we can do.
    let mut skipped = 0;
    let () = walk(synchronized, |frame| {
        if skipped < skip {
            skipped += 1;
            return true
        }

        match (RawFrame::from_frame(frame), buf.get_mut(count)) {
            (Some(raw), Some(slot)) => {
                *slot = raw;
                count += 1;
                count < buf.len()
            }
            _ => false,
        }
    });
    (count, false)
}

fn check_depth(max_depth: usize) -> Result<()> {
    if max_depth == 0 || max_depth > MAX_CAPTURE_DEPTH {
        return Err(Error::with_invalid_input(format!(
            "capture depth {max_depth} is outside of supported range [1, {MAX_CAPTURE_DEPTH}]"
        )))
    }
    Ok(())
}

/// Allocate the one buffer a capture is allowed to use.
fn alloc_frames(max_depth: usize) -> Option<Vec<RawFrame>> {
    let mut frames = Vec::new();
    if let Err(err) = frames.try_reserve_exact(max_depth) {
        log::warn!("failed to allocate buffer for {max_depth} stack frames: {err}");
        return None
    }
    let () = frames.resize(max_depth, RawFrame::default());
    Some(frames)
}

pub(crate) fn capture_at(entry: Addr, max_depth: usize, skip: usize) -> Result<Trace> {
    let () = check_depth(max_depth)?;

    let mut frames = if let Some(frames) = alloc_frames(max_depth) {
        frames
    } else {
        let trace = Trace {
            max_depth,
            ..Trace::from_frames(Vec::new())
        };
        return Ok(trace)
    };

    let (count, found) = capture_frames(entry, skip, true, &mut frames);
    if !found {
        log::debug!("failed to find capturing frame on the stack; trace contains internal frames");
    }
    let () = frames.truncate(count);

    let trace = Trace {
        max_depth,
        ..Trace::from_frames(frames)
    };
    Ok(trace)
}

/// Capture the current call stack.
///
/// The returned trace starts with the caller of this function. `skip`
/// additional innermost frames are omitted and at most `max_depth`
/// frames are captured.
///
/// # Errors
/// An error of kind [`ErrorKind::InvalidInput`][crate::ErrorKind::InvalidInput]
/// is reported if `max_depth` is zero or larger than
/// [`MAX_CAPTURE_DEPTH`]. Failure to allocate the frame buffer is *not*
/// an error: an empty trace is returned in this case.
#[inline(never)]
pub fn capture(max_depth: usize, skip: usize) -> Result<Trace> {
    // The frame of this very function has to stay on the stack so that it
    // can be recognized.
    black_box(capture_at(capture as Addr, max_depth, skip))
}

/// Capture the current call stack into the provided buffer, without
/// allocating.
///
/// The buffer is filled starting with the caller of this function,
/// skipping `skip` additional frames. Returns the number of frames
/// written.
#[inline(never)]
pub fn capture_into(buf: &mut [RawFrame], skip: usize) -> usize {
    let (count, _found) = capture_frames(capture_into as Addr, skip, true, buf);
    black_box(count)
}


#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_pc(context: *const c_void) -> Option<Addr> {
    let context = context.cast::<libc::ucontext_t>();
    // SAFETY: The caller guarantees that `context` points to a valid
    //         `ucontext_t`.
    let pc = unsafe { (*context).uc_mcontext.gregs[libc::REG_RIP as usize] };
    Some(pc as Addr)
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn context_pc(context: *const c_void) -> Option<Addr> {
    let context = context.cast::<libc::ucontext_t>();
    // SAFETY: The caller guarantees that `context` points to a valid
    //         `ucontext_t`.
    let pc = unsafe { (*context).uc_mcontext.pc };
    Some(pc as Addr)
}

#[cfg(all(target_vendor = "apple", target_arch = "x86_64"))]
unsafe fn context_pc(context: *const c_void) -> Option<Addr> {
    let context = context.cast::<libc::ucontext_t>();
    // SAFETY: The caller guarantees that `context` points to a valid
    //         `ucontext_t`, which references the machine context.
    let pc = unsafe { (*(*context).uc_mcontext).__ss.__rip };
    Some(pc as Addr)
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
unsafe fn context_pc(context: *const c_void) -> Option<Addr> {
    let context = context.cast::<libc::ucontext_t>();
    // SAFETY: The caller guarantees that `context` points to a valid
    //         `ucontext_t`, which references the machine context.
    let pc = unsafe { (*(*context).uc_mcontext).__ss.__pc };
    Some(pc as Addr)
}

#[cfg(windows)]
unsafe fn context_pc(context: *const c_void) -> Option<Addr> {
    let pointers = context.cast::<ExceptionPointers>();
    // SAFETY: The caller guarantees that `context` points to valid
    //         `EXCEPTION_POINTERS`.
    let record = unsafe { (*pointers).exception_record };
    if record.is_null() {
        return None
    }
    // SAFETY: The record pointer was checked to be non-NULL and is
    //         provided by the system.
    let pc = unsafe { (*record).exception_address };
    Some(pc as Addr)
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_vendor = "apple", any(target_arch = "x86_64", target_arch = "aarch64")),
    windows,
)))]
unsafe fn context_pc(_context: *const c_void) -> Option<Addr> {
    None
}


/// Capture the call stack of an interrupted execution into `buf`.
///
/// # Safety
/// `context` has to be NULL or point to a valid machine context as
/// documented for [`capture_from`].
pub(crate) unsafe fn capture_from_into(context: *const c_void, buf: &mut [RawFrame]) -> usize {
    let pc = if context.is_null() {
        None
    } else {
        // SAFETY: Guaranteed by the caller.
        unsafe { context_pc(context) }
    };

    let pc = match pc {
        Some(pc) if pc != 0 => pc,
        // Without an interrupted instruction pointer all we can do is to
        // report the frames above the handler.
        _ => return capture_frames(capture_from_into as Addr, 1, false, buf).0,
    };

    // Unwind through the handler and signal trampoline and start
    // reporting at the interrupted frame.
    let mut found = false;
    let mut count = 0;
    let () = walk(false, |frame| {
        if !found {
            if frame.ip() as Addr != pc {
                return true
            }
            found = true;
        }

        match (RawFrame::from_frame(frame), buf.get_mut(count)) {
            (Some(mut raw), Some(slot)) => {
                raw.exact = count == 0;
                *slot = raw;
                count += 1;
                count < buf.len()
            }
            _ => false,
        }
    });

    if found {
        return count
    }

    // The unwinder was unable to step through the trampoline. Report the
    // interrupted instruction followed by what is above the handler.
    if let Some((first, rest)) = buf.split_first_mut() {
        *first = RawFrame {
            addr: pc,
            frame_ptr: None,
            exact: true,
        };
        let (count, _found) = capture_frames(capture_from_into as Addr, 1, false, rest);
        1 + count
    } else {
        0
    }
}

/// Capture the call stack of an execution interrupted by a signal (or
/// structured exception, on Windows).
///
/// A NULL `context` degrades to capturing the frames above the caller's
/// handler. Otherwise `context` is the machine context delivered to the handler: the
/// `ucontext_t` passed as third argument to an `SA_SIGINFO` signal
/// handler on Unix systems and the `EXCEPTION_POINTERS` handed to an
/// exception filter on Windows. The resulting trace starts with the
/// interrupted frame, not with the handler.
///
/// # Safety
/// `context` has to be NULL or point to a valid machine context of the
/// type documented above.
#[inline(never)]
pub unsafe fn capture_from(context: *const c_void, max_depth: usize) -> Result<Trace> {
    let () = check_depth(max_depth)?;

    let mut frames = if let Some(frames) = alloc_frames(max_depth) {
        frames
    } else {
        return Ok(Trace {
            max_depth,
            ..Trace::from_frames(Vec::new())
        })
    };

    // SAFETY: Guaranteed by the caller.
    let count = unsafe { capture_from_into(context, &mut frames) };
    let () = frames.truncate(count);

    let trace = Trace {
        max_depth,
        ..Trace::from_frames(frames)
    };
    Ok(black_box(trace))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ptr;

    use test_log::test;

    use crate::ErrorKind;


    #[inline(never)]
    fn capture_here(max_depth: usize) -> Trace {
        black_box(capture(max_depth, 0).unwrap())
    }

    /// Check that we reject unsupported capture depths.
    #[test]
    fn invalid_depth() {
        let err = capture(0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = capture(MAX_CAPTURE_DEPTH + 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    /// Make sure that the capture depth is honored and that the first
    /// frame belongs to the caller.
    #[test]
    fn capture_depth_limit() {
        let trace = capture_here(2);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.max_depth(), 2);
        assert_eq!(trace.signal(), None);

        let trace = capture_here(1);
        assert_eq!(trace.len(), 1);
        let addr = trace[0].addr;
        let start = capture_here as Addr;
        // The return address lies within `capture_here`. We cannot know
        // the function's size, but it is certainly small.
        assert!(addr > start && addr < start + 0x1000, "{addr:#x} vs. {start:#x}");
    }

    /// Check that skipping frames drops the innermost ones.
    #[test]
    fn capture_skip() {
        let full = capture(8, 0).unwrap();
        let skipped = capture(8, 1).unwrap();
        assert!(!full.is_empty());
        assert_eq!(full.frames()[1..], skipped.frames()[..7]);
    }

    /// Test capturing into a caller provided buffer.
    #[test]
    fn capture_into_buffer() {
        let mut buf = [RawFrame::default(); 4];
        let count = capture_into(&mut buf, 0);
        assert!(count > 0 && count <= buf.len());
        assert!(buf[..count].iter().all(|frame| frame.addr != 0 && !frame.exact));

        let count = capture_into(&mut [], 0);
        assert_eq!(count, 0);
    }

    /// Check that lookup addresses are adjusted for return addresses
    /// only.
    #[test]
    fn lookup_address_adjustment() {
        let frame = RawFrame::new(0x1000);
        assert_eq!(frame.lookup_addr(), 0xfff);

        let frame = RawFrame {
            exact: true,
            ..frame
        };
        assert_eq!(frame.lookup_addr(), 0x1000);
        assert_eq!(RawFrame::new(0).lookup_addr(), 0);
    }

    /// Check that capturing from a NULL context still produces a trace.
    #[test]
    fn capture_from_null_context() {
        let trace = unsafe { capture_from(ptr::null(), 16) }.unwrap();
        assert!(!trace.is_empty());
        assert!(trace.iter().all(|frame| !frame.exact));
    }
}
