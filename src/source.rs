//! Retrieval of source code snippets.
//!
//! Source files are read once and their lines cached for the lifetime of
//! the [`SourceCache`]. There is no invalidation.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::TryLockError;

use crate::log;
use crate::Reason;


/// The environment variable listing directories to search for source
/// files, separated like `PATH`.
pub const SOURCE_PREFIXES_VAR: &str = "CRASHTRACE_SOURCE_PREFIXES";


/// A window of lines of a source file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceSnippet {
    /// The path of the source file, as requested.
    pub path: PathBuf,
    /// The (one-based) number of the first line in `lines`.
    pub first_line: u32,
    /// The lines of the snippet, without line terminators.
    pub lines: Vec<String>,
}

impl SourceSnippet {
    /// Iterate over the lines of the snippet, along with their
    /// (one-based) line numbers.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        (self.first_line..)
            .zip(self.lines.iter())
            .map(|(number, line)| (number, line.as_str()))
    }
}


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}


/// How to treat locks held elsewhere.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Access {
    /// Wait for the lock.
    Blocking,
    /// Give up.
    NonBlocking,
}

impl Access {
    fn acquire<T>(self, mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
        match self {
            Self::Blocking => Some(lock(mutex)),
            Self::NonBlocking => try_lock(mutex),
        }
    }
}


/// Split file contents into lines, dropping trailing blank lines.
fn split_lines(content: &str) -> Vec<String> {
    let mut lines = content.lines().map(str::to_string).collect::<Vec<_>>();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        let _line = lines.pop();
    }
    lines
}

/// Read the first readable of `candidates`, the possible locations of
/// the file at `path`.
fn read(path: &Path, candidates: Vec<PathBuf>) -> Option<Arc<[String]>> {
    for candidate in candidates {
        match fs::read(&candidate) {
            Ok(content) => {
                let content = String::from_utf8_lossy(&content);
                return Some(Arc::from(split_lines(&content)))
            }
            Err(err) => {
                log::trace!("failed to read {}: {err}", candidate.display());
            }
        }
    }

    log::debug!("source file {} is unavailable", path.display());
    None
}


/// A cache of source file contents.
#[derive(Debug, Default)]
pub struct SourceCache {
    /// Directories tried as prefixes of requested paths.
    prefixes: Mutex<Vec<PathBuf>>,
    /// Lines of files, keyed by requested path. Files that could not be
    /// read map to `None`.
    files: Mutex<HashMap<PathBuf, Option<Arc<[String]>>>>,
}

impl SourceCache {
    /// Create a new, empty `SourceCache`, using the prefixes listed in
    /// the `CRASHTRACE_SOURCE_PREFIXES` environment variable.
    pub fn new() -> Self {
        let prefixes = env::var_os(SOURCE_PREFIXES_VAR)
            .map(|value| {
                env::split_paths(&value)
                    .filter(|prefix| !prefix.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self::with_prefixes(prefixes)
    }

    /// Create a new, empty `SourceCache` using the given prefixes.
    pub fn with_prefixes(prefixes: Vec<PathBuf>) -> Self {
        Self {
            prefixes: Mutex::new(prefixes),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Add a directory to try as prefix of source paths.
    ///
    /// Files that previously could not be found are looked up again on
    /// next request.
    pub fn add_prefix<P>(&self, prefix: P)
    where
        P: Into<PathBuf>,
    {
        let () = lock(&self.prefixes).push(prefix.into());
        let () = lock(&self.files).retain(|_path, lines| lines.is_some());
    }

    fn candidates(&self, path: &Path, access: Access) -> Option<Vec<PathBuf>> {
        let prefixes = access.acquire(&self.prefixes)?;
        let rel_path = path.strip_prefix("/").unwrap_or(path);

        let candidates = prefixes
            .iter()
            .map(|prefix| prefix.join(rel_path))
            .chain([path.to_path_buf()])
            .collect();
        Some(candidates)
    }

    /// Retrieve the lines of the file at `path`.
    ///
    /// `None` is returned if the file is unavailable or if a lock could
    /// not be acquired in the requested manner.
    fn lines(&self, path: &Path, access: Access) -> Option<Arc<[String]>> {
        if let Some(lines) = access.acquire(&self.files)?.get(path) {
            return lines.clone()
        }

        // No lock is held while reading. Racing readers of the same file
        // end up with the same lines.
        let candidates = self.candidates(path, access)?;
        let lines = read(path, candidates);
        if let Some(mut files) = access.acquire(&self.files) {
            let _prev = files.insert(path.to_path_buf(), lines.clone());
        }
        lines
    }

    fn lookup_with(
        &self,
        path: &Path,
        line: u32,
        radius: u32,
        access: Access,
    ) -> Result<SourceSnippet, Reason> {
        if line == 0 {
            return Err(Reason::SnippetUnavailable)
        }

        let lines = self
            .lines(path, access)
            .ok_or(Reason::SnippetUnavailable)?;
        let last_line = u32::try_from(lines.len()).unwrap_or(u32::MAX);
        let first = line.saturating_sub(radius).max(1);
        let last = line.saturating_add(radius).min(last_line);
        if first > last {
            return Err(Reason::SnippetUnavailable)
        }

        let snippet = SourceSnippet {
            path: path.to_path_buf(),
            first_line: first,
            lines: lines[first as usize - 1..last as usize].to_vec(),
        };
        Ok(snippet)
    }

    /// Retrieve the lines `[line - radius, line + radius]` of the file
    /// at `path`, clamped to the file's bounds.
    ///
    /// Line numbers are one-based.
    #[inline]
    pub fn lookup(&self, path: &Path, line: u32, radius: u32) -> Result<SourceSnippet, Reason> {
        self.lookup_with(path, line, radius, Access::Blocking)
    }

    /// Retrieve a snippet of the file at `path`, centered around `line`.
    ///
    /// `None` is returned if the file is unavailable or does not contain
    /// the line.
    #[inline]
    pub fn snippet(&self, path: &Path, line: u32, radius: u32) -> Option<SourceSnippet> {
        self.lookup(path, line, radius).ok()
    }

    /// Retrieve a snippet like [`snippet`](Self::snippet) does, but
    /// without ever waiting for a lock. While another thread uses the
    /// cache, no snippet is produced.
    pub fn try_snippet(&self, path: &Path, line: u32, radius: u32) -> Option<SourceSnippet> {
        self.lookup_with(path, line, radius, Access::NonBlocking)
            .ok()
    }

    /// Hold the lock on the cached files while running `f`.
    #[cfg(test)]
    pub(crate) fn with_files_locked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = lock(&self.files);
        f()
    }
}


static GLOBAL: OnceLock<SourceCache> = OnceLock::new();


/// Retrieve the process-wide source cache.
pub fn global() -> &'static SourceCache {
    GLOBAL.get_or_init(SourceCache::new)
}

/// Retrieve the process-wide source cache, if it got created already.
pub(crate) fn try_global() -> Option<&'static SourceCache> {
    GLOBAL.get()
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    use tempfile::tempdir;
    use tempfile::NamedTempFile;

    use test_log::test;


    fn source_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let () = file.write_all(content.as_bytes()).unwrap();
        file
    }

    /// Check that only trailing blank lines are trimmed.
    #[test]
    fn trailing_line_trimming() {
        let lines = split_lines("fn main() {\n\n    foo();\n}\n\n   \n\t\n");
        assert_eq!(lines, vec!["fn main() {", "", "    foo();", "}"]);

        let lines = split_lines("\r\n");
        assert!(lines.is_empty());
    }

    /// Check that snippet windows are clamped at file boundaries.
    #[test]
    fn snippet_clamping() {
        let content = (1..=10).map(|i| format!("line {i}\n")).collect::<String>();
        let file = source_file(&content);
        let cache = SourceCache::with_prefixes(Vec::new());

        let snippet = cache.snippet(file.path(), 5, 2).unwrap();
        assert_eq!(snippet.first_line, 3);
        assert_eq!(snippet.lines, vec!["line 3", "line 4", "line 5", "line 6", "line 7"]);

        let snippet = cache.snippet(file.path(), 1, 3).unwrap();
        assert_eq!(snippet.first_line, 1);
        assert_eq!(snippet.lines.len(), 4);

        let snippet = cache.snippet(file.path(), 10, 3).unwrap();
        assert_eq!(snippet.first_line, 7);
        assert_eq!(snippet.lines.len(), 4);

        let snippet = cache.snippet(file.path(), 4, 0).unwrap();
        assert_eq!(snippet.iter().collect::<Vec<_>>(), vec![(4, "line 4")]);

        let snippet = cache.snippet(file.path(), 5, u32::MAX).unwrap();
        assert_eq!(snippet.lines.len(), 10);

        // Line numbers start at one.
        assert_eq!(cache.lookup(file.path(), 0, 2), Err(Reason::SnippetUnavailable));
        // Lines past the end of the file are not available.
        assert_eq!(cache.lookup(file.path(), 20, 2), Err(Reason::SnippetUnavailable));
        assert_eq!(cache.snippet(file.path(), 12, 2).unwrap().lines, vec!["line 10"]);
    }

    /// Check that the number of lines in a snippet matches expectations
    /// for all combinations of small line numbers and radii.
    #[test]
    fn snippet_length() {
        let content = (1..=7).map(|i| format!("{i}\n")).collect::<String>();
        let file = source_file(&content);
        let cache = SourceCache::with_prefixes(Vec::new());

        for line in 1..=7u32 {
            for radius in 0..=8u32 {
                let snippet = cache.snippet(file.path(), line, radius).unwrap();
                let expected = (line + radius).min(7) - line.saturating_sub(radius).max(1) + 1;
                assert_eq!(snippet.lines.len(), expected as usize, "{line} {radius}");
            }
        }
    }

    /// Make sure that missing files are reported as unavailable, and are
    /// found once a fitting prefix is added.
    #[test]
    fn missing_file_and_prefixes() {
        let dir = tempdir().unwrap();
        let cache = SourceCache::with_prefixes(Vec::new());
        let path = Path::new("src/moved.rs");
        assert_eq!(cache.lookup(path, 1, 1), Err(Reason::SnippetUnavailable));

        let () = fs::create_dir(dir.path().join("src")).unwrap();
        let () = fs::write(dir.path().join("src").join("moved.rs"), "fn moved() {}\n").unwrap();
        // The failure is cached until a prefix is added.
        assert_eq!(cache.lookup(path, 1, 1), Err(Reason::SnippetUnavailable));

        let () = cache.add_prefix(dir.path());
        let snippet = cache.snippet(path, 1, 1).unwrap();
        assert_eq!(snippet.lines, vec!["fn moved() {}"]);
        assert_eq!(snippet.path, path);
    }

    /// Check that file contents are cached after the first read.
    #[test]
    fn content_caching() {
        let file = source_file("first\nsecond\n");
        let cache = SourceCache::with_prefixes(Vec::new());
        assert_eq!(cache.snippet(file.path(), 1, 0).unwrap().lines, vec!["first"]);

        let () = fs::write(file.path(), "changed\n").unwrap();
        assert_eq!(cache.snippet(file.path(), 1, 0).unwrap().lines, vec!["first"]);
        assert_eq!(cache.snippet(file.path(), 2, 0).unwrap().lines, vec!["second"]);
    }

    /// Check that non-blocking lookups give up while the cache is in
    /// use elsewhere, without caching the failure.
    #[test]
    fn nonblocking_lookup() {
        let file = source_file("first\nsecond\n");
        let cache = SourceCache::with_prefixes(Vec::new());

        let snippet = cache.with_files_locked(|| cache.try_snippet(file.path(), 1, 0));
        assert_eq!(snippet, None);

        let snippet = cache.try_snippet(file.path(), 2, 0).unwrap();
        assert_eq!(snippet.lines, vec!["second"]);
        assert_eq!(cache.snippet(file.path(), 1, 0).unwrap().lines, vec!["first"]);
    }
}
