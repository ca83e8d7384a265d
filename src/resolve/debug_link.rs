//! Support for locating separate debug files via GNU debug links.
//!
//! A `.gnu_debuglink` section contains the file name of the debug file,
//! NUL terminated and padded to the next four byte boundary, followed by
//! a CRC32 checksum of the debug file's contents.

use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use crate::image::Image;
use crate::log;


/// The global directory searched for debug files.
const GLOBAL_DEBUG_DIR: &str = "/usr/lib/debug";


enum State {
    /// The directory of the module itself.
    SameDir,
    /// The `.debug` sub-directory of the module's directory.
    DebugSubDir,
    /// The module's directory, below the global debug directory.
    GlobalDir,
    Done,
}


/// An iterator over the paths at which the target of a debug link may
/// be found.
pub(crate) struct DebugFileIter<'path> {
    /// The directory of the file containing the debug link.
    linker_dir: &'path Path,
    /// The directory below which module directories are mirrored.
    global_dir: &'path Path,
    /// The debug link target file.
    linkee: &'path OsStr,
    state: State,
}

impl<'path> DebugFileIter<'path> {
    pub(crate) fn new(linker: &'path Path, global_dir: &'path Path, linkee: &'path OsStr) -> Self {
        Self {
            linker_dir: linker.parent().unwrap_or_else(|| Path::new("")),
            global_dir,
            linkee,
            state: State::SameDir,
        }
    }
}

impl Iterator for DebugFileIter<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::SameDir => {
                self.state = State::DebugSubDir;
                Some(self.linker_dir.join(self.linkee))
            }
            State::DebugSubDir => {
                self.state = State::GlobalDir;
                Some(self.linker_dir.join(".debug").join(self.linkee))
            }
            State::GlobalDir => {
                self.state = State::Done;
                // Strip the root to make the directory relative, so that
                // joining works as expected.
                let rel_dir = self
                    .linker_dir
                    .strip_prefix("/")
                    .unwrap_or(self.linker_dir);
                Some(self.global_dir.join(rel_dir).join(self.linkee))
            }
            State::Done => None,
        }
    }
}


const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xedb88320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate the CRC32 checksum used by debug links.
pub(crate) fn debug_link_crc32(data: &[u8]) -> u32 {
    static CRC32_TABLE: [u32; 256] = crc32_table();

    let crc = data.iter().fold(!0u32, |crc, byte| {
        let idx = (crc ^ u32::from(*byte)) & 0xff;
        CRC32_TABLE[idx as usize] ^ (crc >> 8)
    });
    !crc
}


/// Find and open the separate debug file linked to by the ELF file at
/// `linker`.
///
/// Candidates with a mismatching checksum are skipped.
pub(crate) fn find_debug_file(linker: &Path, image: &Image) -> Option<Image> {
    find_debug_file_in(linker, image, Path::new(GLOBAL_DEBUG_DIR))
}

fn find_debug_file_in(linker: &Path, image: &Image, global_dir: &Path) -> Option<Image> {
    let (linkee, crc) = match image.debug_link() {
        Ok(Some(link)) => link,
        Ok(None) => return None,
        Err(err) => {
            log::debug!("failed to read debug link of {}: {err}", linker.display());
            return None
        }
    };

    for candidate in DebugFileIter::new(linker, global_dir, linkee) {
        let debug_file = match Image::open(&candidate) {
            Ok(debug_file) => debug_file,
            Err(_) => continue,
        };

        if debug_link_crc32(debug_file.data()) != crc {
            log::debug!(
                "debug file {} has mismatching checksum; ignoring it",
                candidate.display()
            );
            continue
        }

        log::debug!(
            "using debug file {} for {}",
            candidate.display(),
            linker.display()
        );
        return Some(debug_file)
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::env::current_exe;
    use std::fs;

    use tempfile::tempdir;
    use test_log::test;


    /// Check our CRC32 implementation against well known values.
    #[test]
    fn crc32_checksum() {
        assert_eq!(debug_link_crc32(b""), 0);
        assert_eq!(debug_link_crc32(b"123456789"), 0xcbf43926);
        assert_eq!(
            debug_link_crc32(b"The quick brown fox jumps over the lazy dog"),
            0x414fa339
        );
    }

    /// Make sure that we iterate over all debug file candidates in the
    /// expected order.
    #[test]
    fn debug_file_iteration() {
        let files = DebugFileIter::new(
            Path::new("/usr/lib64/libc.so"),
            Path::new(GLOBAL_DEBUG_DIR),
            OsStr::new("libc.so.debug"),
        )
        .collect::<Vec<_>>();

        let expected = vec![
            PathBuf::from("/usr/lib64/libc.so.debug"),
            PathBuf::from("/usr/lib64/.debug/libc.so.debug"),
            PathBuf::from("/usr/lib/debug/usr/lib64/libc.so.debug"),
        ];
        assert_eq!(files, expected);
    }

    /// Check that a file without debug link does not yield a debug
    /// file.
    #[test]
    fn no_debug_link() {
        let dir = tempdir().unwrap();
        let exe = current_exe().unwrap();
        let image = Image::open(&exe).unwrap();
        // Test binaries are not split, so there is no link to follow.
        if image.debug_link().unwrap().is_none() {
            assert!(find_debug_file_in(&exe, &image, dir.path()).is_none());
        }

        let () = fs::write(dir.path().join("unrelated.debug"), b"data").unwrap();
        assert!(find_debug_file_in(&dir.path().join("unrelated"), &image, dir.path()).is_none());
    }
}
