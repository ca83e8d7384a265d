//! Resolution of raw addresses into modules, symbols, and source
//! locations.
//!
//! Resolution never fails as a whole. Missing information merely leaves
//! the corresponding fields of a [`ResolvedFrame`] empty, with a
//! [`Reason`] explaining the cause.

#[cfg(target_vendor = "apple")]
mod darwin;
#[cfg(target_os = "linux")]
mod debug_link;
#[cfg(unix)]
mod dladdr;
#[cfg(all(feature = "dwarf", any(target_os = "linux", target_vendor = "apple")))]
mod dwarf;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
mod unknown;
#[cfg(windows)]
mod windows;

use std::collections::HashMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::Index;
use std::path::PathBuf;
use std::slice;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;

use crate::capture::RawFrame;
use crate::capture::Trace;
use crate::demangle::demangle;
use crate::demangle::is_mangled;
use crate::log;
use crate::module::Module;
use crate::module::ModuleIndex;
use crate::Addr;
use crate::Result;

#[cfg(target_vendor = "apple")]
use darwin::Session;
#[cfg(target_os = "linux")]
use linux::Session;
#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
use unknown::Session;
#[cfg(windows)]
use windows::Session;

#[cfg(unix)]
pub(crate) use dladdr::dladdr;


/// The reason why information about a frame is missing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Reason {
    /// The stack could not be captured.
    UnavailableCapture,
    /// The address does not belong to any loaded module.
    ModuleNotFound,
    /// The module has no debug information or it could not be loaded.
    DebugInfoUnavailable,
    /// The module does not contain any symbols.
    MissingSymbols,
    /// The address is not covered by the module's symbols or debug
    /// information.
    UnknownAddr,
    /// The symbol name appears mangled but could not be demangled.
    DemangleFailed,
    /// The source file is missing or unreadable.
    SnippetUnavailable,
}

impl Reason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::UnavailableCapture => "stack capture is unavailable",
            Self::ModuleNotFound => "address does not belong to a loaded module",
            Self::DebugInfoUnavailable => "debug information is unavailable",
            Self::MissingSymbols => "module contains no symbols",
            Self::UnknownAddr => "address is not covered by any symbol",
            Self::DemangleFailed => "symbol could not be demangled",
            Self::SnippetUnavailable => "source file is unavailable",
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}


/// Symbolic information about one (possibly inlined) frame, as reported
/// by a debug session.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SymFrame {
    /// The raw, possibly mangled, name of the function.
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}


/// The result of looking up an address in a debug session.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Lookup {
    /// Frames, innermost first. The last one is the function that
    /// everything else got inlined into.
    pub frames: Vec<SymFrame>,
    /// The name of the outermost function, as per the symbol table.
    pub object_function: Option<String>,
}


/// Options controlling what a debug session consults.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Options {
    pub debug_info: bool,
    pub symbol_table: bool,
    pub debug_link: bool,
    pub demangle: bool,
}


/// The interface implemented by the per-platform debug sessions.
///
/// A session owns all native resources necessary for looking up
/// addresses in one module and releases them when dropped.
pub(crate) trait DebugSession: Sized {
    /// Open a session for `module`.
    fn open(module: &Module, opts: &Options) -> Result<Self>;

    /// Look up the absolute address `addr`, which lies within `module`.
    fn lookup(&self, module: &Module, addr: Addr) -> Result<Lookup, Reason>;
}


/// A resolved stack frame.
///
/// A single captured frame expands into multiple resolved frames if
/// functions were inlined at the captured address.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedFrame {
    /// The address as captured.
    pub raw_address: Addr,
    /// The module the address belongs to.
    pub module: Option<Arc<Module>>,
    /// The symbol name as found in the module.
    pub mangled_name: Option<String>,
    /// The demangled version of `mangled_name`.
    pub demangled_name: Option<String>,
    /// The name of the function in the module's symbol table that
    /// contains the address. For inlined frames this is the function
    /// everything got inlined into.
    pub object_function: Option<String>,
    /// The source file.
    pub source_file: Option<PathBuf>,
    /// The source line.
    pub source_line: Option<u32>,
    /// The source column.
    pub source_column: Option<u32>,
    /// Whether the frame is an inlined call, contained in the frame
    /// that follows it.
    pub is_inline: bool,
    /// The reason why some information is absent, if any.
    pub reason: Option<Reason>,
}

impl ResolvedFrame {
    fn unresolved(raw_address: Addr, module: Option<Arc<Module>>, reason: Reason) -> Self {
        Self {
            raw_address,
            module,
            reason: Some(reason),
            ..Default::default()
        }
    }

    /// Retrieve the best available name of the frame's function: the
    /// demangled name, falling back to the mangled one.
    pub fn name(&self) -> Option<&str> {
        self.demangled_name
            .as_deref()
            .or(self.mangled_name.as_deref())
    }
}


/// A resolved stack trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedTrace {
    frames: Vec<ResolvedFrame>,
    thread_id: u64,
    signal: Option<i32>,
    fault_addr: Option<Addr>,
}

impl ResolvedTrace {
    /// Create a `ResolvedTrace` from already resolved frames.
    pub fn from_frames(frames: Vec<ResolvedFrame>) -> Self {
        Self {
            frames,
            ..Default::default()
        }
    }

    /// Retrieve the resolved frames, innermost first.
    #[inline]
    pub fn frames(&self) -> &[ResolvedFrame] {
        &self.frames
    }

    /// Iterate over the resolved frames, innermost first.
    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, ResolvedFrame> {
        self.frames.iter()
    }

    /// The number of resolved frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check whether the trace contains any frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The identifier of the thread the trace was captured on.
    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// The signal that caused the capture, if any.
    #[inline]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// The faulting address reported along with the signal, if any.
    #[inline]
    pub fn fault_addr(&self) -> Option<Addr> {
        self.fault_addr
    }
}

impl Index<usize> for ResolvedTrace {
    type Output = ResolvedFrame;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.frames[idx]
    }
}

impl<'trace> IntoIterator for &'trace ResolvedTrace {
    type Item = &'trace ResolvedFrame;
    type IntoIter = slice::Iter<'trace, ResolvedFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


/// A builder for configurable construction of [`Resolver`] objects.
///
/// By default all sources of information are enabled.
#[derive(Clone, Debug)]
pub struct Builder {
    /// See [`Builder::enable_debug_info`].
    debug_info: bool,
    /// See [`Builder::enable_symbol_table`].
    symbol_table: bool,
    /// See [`Builder::enable_debug_link`].
    debug_link: bool,
    /// See [`Builder::enable_demangling`].
    demangle: bool,
}

impl Builder {
    /// Enable/disable the usage of rich debug information (DWARF on
    /// Linux, PDB on Windows) for resolving source locations and
    /// inlined functions.
    pub fn enable_debug_info(mut self, enable: bool) -> Builder {
        self.debug_info = enable;
        self
    }

    /// Enable/disable the usage of symbol tables and exported symbols
    /// for resolving function names.
    pub fn enable_symbol_table(mut self, enable: bool) -> Builder {
        self.symbol_table = enable;
        self
    }

    /// Enable/disable following `.gnu_debuglink` sections to separate
    /// debug files.
    ///
    /// # Notes
    /// This property only has a meaning if usage of debug information
    /// is enabled as well.
    pub fn enable_debug_link(mut self, enable: bool) -> Builder {
        self.debug_link = enable;
        self
    }

    /// Enable/disable the demangling of symbol names.
    pub fn enable_demangling(mut self, enable: bool) -> Builder {
        self.demangle = enable;
        self
    }

    /// Create the [`Resolver`] object.
    pub fn build(self) -> Resolver {
        let Builder {
            debug_info,
            symbol_table,
            debug_link,
            demangle,
        } = self;

        Resolver {
            opts: Options {
                debug_info,
                symbol_table,
                debug_link: debug_info && debug_link,
                demangle,
            },
            modules: ModuleIndex::new(),
            sessions: HashMap::new(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            debug_info: true,
            symbol_table: true,
            debug_link: true,
            demangle: true,
        }
    }
}


/// A resolver for captured stack traces.
///
/// A resolver caches the module index of the process as well as one
/// debug session per module it encountered. Sessions are kept for the
/// lifetime of the resolver; repeated lookups in a module do not parse
/// its debug information again.
#[derive(Debug)]
pub struct Resolver {
    opts: Options,
    modules: ModuleIndex,
    /// Debug sessions, keyed by module file. Modules for which session
    /// creation failed map to `None`.
    sessions: HashMap<PathBuf, Option<Session>>,
}

impl Resolver {
    /// Create a new [`Resolver`].
    ///
    /// This method is just a short hand for instantiating a `Resolver`
    /// from the default [`Builder`].
    #[inline]
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`Resolver`].
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Retrieve the module index used by this resolver.
    #[inline]
    pub fn modules(&mut self) -> &mut ModuleIndex {
        &mut self.modules
    }

    /// Retrieve the debug session for `module`, creating it if
    /// necessary.
    fn session<'s>(
        sessions: &'s mut HashMap<PathBuf, Option<Session>>,
        opts: &Options,
        module: &Module,
    ) -> Option<&'s Session> {
        sessions
            .entry(module.file().to_path_buf())
            .or_insert_with(|| match Session::open(module, opts) {
                Ok(session) => {
                    log::debug!("opened debug session for {}", module.path.display());
                    Some(session)
                }
                Err(err) => {
                    log::debug!(
                        "failed to open debug session for {}: {err}",
                        module.path.display()
                    );
                    None
                }
            })
            .as_ref()
    }

    fn resolve_frame(&mut self, raw: &RawFrame, resolved: &mut Vec<ResolvedFrame>) {
        let addr = raw.lookup_addr();
        let module = if let Some(module) = self.modules.find(addr) {
            module
        } else {
            let frame = ResolvedFrame::unresolved(raw.addr, None, Reason::ModuleNotFound);
            let () = resolved.push(frame);
            return
        };

        if !self.opts.debug_info && !self.opts.symbol_table {
            let frame =
                ResolvedFrame::unresolved(raw.addr, Some(module), Reason::DebugInfoUnavailable);
            let () = resolved.push(frame);
            return
        }

        let lookup = match Self::session(&mut self.sessions, &self.opts, &module) {
            Some(session) => session.lookup(&module, addr),
            None => Err(Reason::DebugInfoUnavailable),
        };

        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(reason) => {
                let frame = ResolvedFrame::unresolved(raw.addr, Some(module), reason);
                let () = resolved.push(frame);
                return
            }
        };
        let () = expand_lookup(raw.addr, &module, lookup, &self.opts, resolved);
    }

    /// Resolve a captured trace.
    pub fn resolve(&mut self, trace: &Trace) -> ResolvedTrace {
        let mut frames = Vec::with_capacity(trace.len());
        for raw in trace {
            let () = self.resolve_frame(raw, &mut frames);
        }

        ResolvedTrace {
            frames,
            thread_id: trace.thread_id(),
            signal: trace.signal(),
            fault_addr: trace.fault_addr(),
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}


/// Convert the result of a lookup into resolved frames.
fn expand_lookup(
    raw_address: Addr,
    module: &Arc<Module>,
    lookup: Lookup,
    opts: &Options,
    resolved: &mut Vec<ResolvedFrame>,
) {
    let Lookup {
        mut frames,
        object_function,
    } = lookup;

    if frames.is_empty() {
        let frame = SymFrame {
            name: object_function.clone(),
            ..Default::default()
        };
        let () = frames.push(frame);
    }

    let count = frames.len();
    for (idx, frame) in frames.into_iter().enumerate() {
        let SymFrame {
            name,
            file,
            line,
            column,
        } = frame;

        let mut reason = None;
        let demangled_name = match &name {
            Some(name) if opts.demangle => {
                let demangled = demangle(name);
                if demangled.is_none() && is_mangled(name) {
                    reason = Some(Reason::DemangleFailed);
                }
                demangled
            }
            Some(_) => None,
            None => {
                reason = Some(Reason::UnknownAddr);
                None
            }
        };

        let frame = ResolvedFrame {
            raw_address,
            module: Some(Arc::clone(module)),
            mangled_name: name,
            demangled_name,
            object_function: object_function.clone(),
            source_file: file,
            source_line: line,
            source_column: column,
            is_inline: idx + 1 < count,
            reason,
        };
        let () = resolved.push(frame);
    }
}


/// The resolver shared by the top-level functions and the crash handler.
static SHARED: Mutex<Option<Resolver>> = Mutex::new(None);


/// Run `f` with the shared resolver, creating it if necessary.
pub(crate) fn with_shared<F, R>(f: F) -> R
where
    F: FnOnce(&mut Resolver) -> R,
{
    let mut guard = SHARED.lock().unwrap_or_else(|err| err.into_inner());
    f(shared_resolver(&mut guard))
}

/// Run `f` with the shared resolver, unless it is currently in use.
///
/// This function never blocks, which makes it usable in contexts in
/// which the current thread may already hold the lock.
pub(crate) fn try_with_shared<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Resolver) -> R,
{
    let mut guard = match SHARED.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(err)) => err.into_inner(),
        Err(TryLockError::WouldBlock) => return None,
    };
    Some(f(shared_resolver(&mut guard)))
}

fn shared_resolver<'guard>(
    guard: &'guard mut MutexGuard<'_, Option<Resolver>>,
) -> &'guard mut Resolver {
    guard.get_or_insert_with(Resolver::new)
}

/// Build the shared resolver, its module index, and the debug session
/// of the module containing `addr` ahead of time.
pub(crate) fn prepare_shared(addr: Addr) {
    with_shared(|resolver| {
        let frame = RawFrame {
            addr,
            frame_ptr: None,
            exact: true,
        };
        let _trace = resolver.resolve(&Trace::from_frames(vec![frame]));
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::hint::black_box;
    use std::path::Path;

    use test_log::test;

    use crate::module::Segment;


    fn module() -> Arc<Module> {
        let segment = Segment {
            range: 0x1000..0x2000,
            file_offset: 0,
        };
        let module = Module::new(
            PathBuf::from("/usr/bin/app"),
            PathBuf::from("/usr/bin/app"),
            vec![segment],
        )
        .unwrap();
        Arc::new(module)
    }

    fn opts() -> Options {
        Options {
            debug_info: true,
            symbol_table: true,
            debug_link: false,
            demangle: true,
        }
    }

    /// Check that inlined frames are expanded innermost first, with all
    /// but the last marked as inlined.
    #[test]
    fn inline_expansion() {
        let lookup = Lookup {
            frames: vec![
                SymFrame {
                    name: Some("inner".to_string()),
                    file: Some(PathBuf::from("src/inner.rs")),
                    line: Some(10),
                    column: Some(5),
                },
                SymFrame {
                    name: Some("outer".to_string()),
                    file: Some(PathBuf::from("src/outer.rs")),
                    line: Some(20),
                    column: None,
                },
            ],
            object_function: Some("outer".to_string()),
        };

        let mut frames = Vec::new();
        let () = expand_lookup(0x1234, &module(), lookup, &opts(), &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].name(), Some("inner"));
        assert!(frames[0].is_inline);
        assert_eq!(frames[0].source_file.as_deref(), Some(Path::new("src/inner.rs")));
        assert_eq!(frames[0].source_line, Some(10));
        assert_eq!(frames[0].object_function.as_deref(), Some("outer"));
        assert_eq!(frames[1].name(), Some("outer"));
        assert!(!frames[1].is_inline);
        assert!(frames.iter().all(|frame| frame.raw_address == 0x1234));
        assert!(frames.iter().all(|frame| frame.reason.is_none()));
    }

    /// Check that a symbol table only lookup yields a single frame.
    #[test]
    fn symbol_only_expansion() {
        let lookup = Lookup {
            frames: Vec::new(),
            object_function: Some("_ZN3foo3barE".to_string()),
        };

        let mut frames = Vec::new();
        let () = expand_lookup(0x1234, &module(), lookup, &opts(), &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mangled_name.as_deref(), Some("_ZN3foo3barE"));
        assert!(!frames[0].is_inline);
        assert_eq!(frames[0].source_file, None);

        let lookup = Lookup::default();
        let mut frames = Vec::new();
        let () = expand_lookup(0x1234, &module(), lookup, &opts(), &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name(), None);
        assert_eq!(frames[0].reason, Some(Reason::UnknownAddr));
    }

    /// Check that disabling demangling keeps the raw name only.
    #[test]
    fn disabled_demangling() {
        let lookup = Lookup {
            frames: vec![SymFrame {
                name: Some("_ZN3foo3barE".to_string()),
                ..Default::default()
            }],
            object_function: None,
        };
        let opts = Options {
            demangle: false,
            ..opts()
        };

        let mut frames = Vec::new();
        let () = expand_lookup(0x1234, &module(), lookup, &opts, &mut frames);
        assert_eq!(frames[0].demangled_name, None);
        assert_eq!(frames[0].name(), Some("_ZN3foo3barE"));
        assert_eq!(frames[0].reason, None);
    }

    /// Make sure that addresses outside of all modules are reported as
    /// such.
    #[test]
    fn unknown_module() {
        let mut resolver = Resolver::new();
        let trace = Trace::from_frames(vec![RawFrame::new(1)]);
        let resolved = resolver.resolve(&trace);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].raw_address, 1);
        assert_eq!(resolved[0].module, None);
        assert_eq!(resolved[0].name(), None);
        assert_eq!(resolved[0].reason, Some(Reason::ModuleNotFound));
    }

    #[inline(never)]
    fn resolvable_function() -> usize {
        black_box(42)
    }

    /// Check that disabling all sources of information yields module
    /// only resolution.
    #[cfg(any(target_os = "linux", target_vendor = "apple", windows))]
    #[test]
    fn module_only_resolution() {
        let addr = resolvable_function as Addr;
        let mut resolver = Resolver::builder()
            .enable_debug_info(false)
            .enable_symbol_table(false)
            .build();
        let trace = Trace::from_frames(vec![RawFrame {
            addr,
            frame_ptr: None,
            exact: true,
        }]);
        let resolved = resolver.resolve(&trace);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].module.is_some());
        assert_eq!(resolved[0].name(), None);
        assert_eq!(resolved[0].source_file, None);
        assert_eq!(resolved[0].reason, Some(Reason::DebugInfoUnavailable));
    }

    /// Check that we can resolve a function of our own, repeatedly and
    /// across a rebuild of the module index.
    #[cfg(any(target_os = "linux", target_vendor = "apple"))]
    #[test]
    fn own_function_resolution() {
        let addr = resolvable_function as Addr;
        let trace = Trace::from_frames(vec![RawFrame {
            addr,
            frame_ptr: None,
            exact: true,
        }]);

        let mut resolver = Resolver::new();
        let first = resolver.resolve(&trace);
        let name = first
            .iter()
            .filter_map(ResolvedFrame::name)
            .last()
            .unwrap();
        assert!(name.contains("resolvable_function"), "{name}");

        let second = resolver.resolve(&trace);
        assert_eq!(first, second);

        let () = resolver.modules().invalidate();
        let third = resolver.resolve(&trace);
        assert_eq!(first, third);
    }

    /// Exercise the shared resolver accessors.
    #[test]
    fn shared_resolver_access() {
        let () = prepare_shared(resolvable_function as Addr);
        let debug_info = with_shared(|resolver| resolver.opts.debug_info);
        assert!(debug_info);

        // While the lock is held, `try_with_shared` must not block.
        let nested = with_shared(|_resolver| try_with_shared(|_resolver| ()));
        assert_eq!(nested, None);
    }

    /// Check the textual representation of reasons.
    #[test]
    fn reason_display() {
        assert_eq!(
            Reason::ModuleNotFound.to_string(),
            "address does not belong to a loaded module"
        );
        assert_ne!(Reason::UnavailableCapture.to_string(), "");
    }
}
