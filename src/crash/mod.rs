//! Reporting of fatal signals and unhandled exceptions.
//!
//! Once installed, the crash handler prints the stack trace of the
//! faulting thread to standard error when the process receives one of
//! the configured signals (or, on Windows, raises an unhandled
//! structured exception). Afterwards the default disposition is
//! restored and the signal re-raised, so that the process terminates
//! the way it would have without the handler: the handler observes, it
//! never recovers.
//!
//! Symbol resolution inside a signal handler is inherently best-effort.
//! The handler only ever try-locks the shared resolver. If it is
//! unavailable (for example, because the crash happened while the
//! interrupted thread was resolving a trace itself) or if resolution
//! was disabled, only raw addresses and module names are printed,
//! without allocating.

#[cfg(unix)]
mod unix;
#[cfg(not(any(unix, windows)))]
mod unsupported;
#[cfg(windows)]
mod windows;

use std::cell::UnsafeCell;
use std::fmt;
use std::fmt::Write as _;
use std::io::stderr;
use std::io::IsTerminal as _;
use std::panic;
use std::str;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::capture::RawFrame;
use crate::capture::Trace;
use crate::print;
use crate::print::PrintOptions;
use crate::print::UNKNOWN_LOCATION;
use crate::print::UNKNOWN_NAME;
use crate::resolve::prepare_shared;
use crate::resolve::try_with_shared;
use crate::source;
use crate::Addr;
use crate::Error;
use crate::Reason;
use crate::Result;

#[cfg(unix)]
use unix as sys;
#[cfg(not(any(unix, windows)))]
use unsupported as sys;
#[cfg(windows)]
use windows as sys;

#[cfg(windows)]
pub(crate) use windows::ExceptionPointers;


/// The maximum number of frames reported for a crash.
pub const MAX_SIGNAL_DEPTH: usize = 64;
/// The default size of the alternate stack signal handlers run on.
pub const DEFAULT_ALT_STACK_SIZE: usize = 512 * 1024;

const UNINSTALLED: u8 = 0;
const INSTALLED: u8 = 1;
const TRIGGERED: u8 = 2;


/// The signals handled by default.
#[cfg(unix)]
pub fn default_signals() -> Vec<i32> {
    #[cfg(target_vendor = "apple")]
    const PLATFORM: &[i32] = &[libc::SIGEMT];
    #[cfg(not(target_vendor = "apple"))]
    const PLATFORM: &[i32] = &[];

    let mut signals = vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGQUIT,
        libc::SIGSEGV,
        libc::SIGSYS,
        libc::SIGTRAP,
        libc::SIGXCPU,
        libc::SIGXFSZ,
    ];
    let () = signals.extend_from_slice(PLATFORM);
    signals
}

/// The signals handled by default.
///
/// Structured exceptions are always reported, this list only covers the
/// C runtime's signals.
#[cfg(windows)]
pub fn default_signals() -> Vec<i32> {
    vec![libc::SIGABRT]
}

/// The signals handled by default.
#[cfg(not(any(unix, windows)))]
pub fn default_signals() -> Vec<i32> {
    Vec::new()
}


/// Retrieve the conventional name of a signal, e.g., `SIGSEGV`.
#[cfg(unix)]
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGHUP => "SIGHUP",
        libc::SIGILL => "SIGILL",
        libc::SIGINT => "SIGINT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTERM => "SIGTERM",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        #[cfg(target_vendor = "apple")]
        libc::SIGEMT => "SIGEMT",
        _ => "unknown signal",
    }
}

/// Retrieve the conventional name of a signal, e.g., `SIGSEGV`.
#[cfg(windows)]
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGINT => "SIGINT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown signal",
    }
}

/// Retrieve the conventional name of a signal, e.g., `SIGSEGV`.
#[cfg(not(any(unix, windows)))]
pub fn signal_name(_signal: i32) -> &'static str {
    "unknown signal"
}


/// Configuration of the crash handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CrashConfig {
    /// The signals to handle.
    pub signals: Vec<i32>,
    /// The maximum number of frames to report, at most
    /// [`MAX_SIGNAL_DEPTH`].
    pub max_depth: usize,
    /// Whether to attempt resolving symbols when a crash is reported.
    ///
    /// When disabled, or when the resolver is unavailable at the time
    /// of the crash, raw addresses and module paths are printed.
    pub resolve_symbols: bool,
    /// Whether to colorize the report.
    pub colorize: bool,
    /// Whether to include source code snippets in the report.
    pub show_snippets: bool,
    /// The size of the alternate stack that signal handlers run on. A
    /// size of zero runs handlers on the stack of the interrupted
    /// thread, which prevents reporting of stack overflows.
    ///
    /// The alternate stack is registered for the installing thread only.
    pub alt_stack_size: usize,
}

impl CrashConfig {
    fn validate(&self) -> Result<()> {
        if self.signals.is_empty() {
            return Err(Error::with_invalid_input("no signals to handle provided"))
        }

        if self.max_depth == 0 || self.max_depth > MAX_SIGNAL_DEPTH {
            return Err(Error::with_invalid_input(format!(
                "crash report depth {} is outside of supported range [1, {MAX_SIGNAL_DEPTH}]",
                self.max_depth
            )))
        }
        Ok(())
    }
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            signals: default_signals(),
            max_depth: 32,
            resolve_symbols: true,
            colorize: stderr().is_terminal(),
            show_snippets: false,
            alt_stack_size: DEFAULT_ALT_STACK_SIZE,
        }
    }
}


/// The state of the crash handler.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum State {
    /// No handler is installed.
    Uninstalled,
    /// Handlers are installed and waiting for a crash.
    Installed,
    /// A crash is being reported.
    Triggered,
}


static STATE: AtomicU8 = AtomicU8::new(UNINSTALLED);
static MAX_DEPTH: AtomicUsize = AtomicUsize::new(MAX_SIGNAL_DEPTH);
static RESOLVE: AtomicBool = AtomicBool::new(true);
static COLORIZE: AtomicBool = AtomicBool::new(false);
static SNIPPETS: AtomicBool = AtomicBool::new(false);

static INSTALLATION: Mutex<Option<sys::Installation>> = Mutex::new(None);


struct FrameBuffer(UnsafeCell<[RawFrame; MAX_SIGNAL_DEPTH]>);

// SAFETY: The buffer is only ever accessed by the one thread that
//         moved the handler into the triggered state.
unsafe impl Sync for FrameBuffer {}

static FRAMES: FrameBuffer = FrameBuffer(UnsafeCell::new(
    [RawFrame {
        addr: 0,
        frame_ptr: None,
        exact: false,
    }; MAX_SIGNAL_DEPTH],
));


fn lock() -> MutexGuard<'static, Option<sys::Installation>> {
    INSTALLATION
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

/// Retrieve the current state of the crash handler.
pub fn state() -> State {
    match STATE.load(Ordering::SeqCst) {
        UNINSTALLED => State::Uninstalled,
        INSTALLED => State::Installed,
        _ => State::Triggered,
    }
}

/// Move the handler into the triggered state.
///
/// Only the first caller after installation succeeds; everybody else
/// has to proceed with the default action right away.
fn trigger() -> bool {
    STATE
        .compare_exchange(INSTALLED, TRIGGERED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Retrieve the buffer to capture the crashing thread's frames in, sized
/// to the configured depth.
///
/// # Safety
/// The caller has to have moved the handler into the triggered state
/// via [`trigger`].
unsafe fn frame_buffer() -> &'static mut [RawFrame] {
    let depth = MAX_DEPTH.load(Ordering::Relaxed).min(MAX_SIGNAL_DEPTH);
    // SAFETY: The caller guarantees exclusive access.
    let frames = unsafe { &mut *FRAMES.0.get() };
    &mut frames[..depth]
}


/// Install the crash handler.
///
/// # Errors
/// An error of kind [`ErrorKind::InvalidInput`][crate::ErrorKind::InvalidInput]
/// is reported if a handler is already installed, if no signals are
/// provided, or if the maximum depth is out of range. Failure of the
/// system to install a handler is reported as well, in which case no
/// handler remains installed.
pub fn install(config: &CrashConfig) -> Result<()> {
    let () = config.validate()?;

    let mut installation = lock();
    if installation.is_some() {
        return Err(Error::with_invalid_input(
            "crash handler is already installed",
        ))
    }

    let () = MAX_DEPTH.store(config.max_depth, Ordering::SeqCst);
    let () = RESOLVE.store(config.resolve_symbols, Ordering::SeqCst);
    let () = COLORIZE.store(config.colorize, Ordering::SeqCst);
    let () = SNIPPETS.store(config.show_snippets, Ordering::SeqCst);

    if config.resolve_symbols {
        // Do as much of the work the handler may have to do up front.
        let () = prepare_shared(install as Addr);
        if config.show_snippets {
            let _cache = source::global();
        }
    }

    *installation = Some(sys::Installation::new(config)?);
    let () = STATE.store(INSTALLED, Ordering::SeqCst);
    Ok(())
}

/// Uninstall the crash handler, restoring the handlers that were in place
/// before its installation.
///
/// Calling this function without a handler being installed is a no-op.
pub fn uninstall() -> Result<()> {
    let mut installation = lock();
    let result = if let Some(installation) = installation.take() {
        installation.uninstall()
    } else {
        Ok(())
    };
    let () = STATE.store(UNINSTALLED, Ordering::SeqCst);
    result
}


/// A fixed size buffer for formatting report lines without allocating.
///
/// Output exceeding the buffer's capacity is truncated.
struct LineBuffer {
    buf: [u8; 512],
    len: usize,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn flush(&mut self) {
        let () = sys::emit(self.as_bytes());
        self.len = 0;
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let count = s.len().min(self.buf.len() - self.len);
        let () = self.buf[self.len..self.len + count].copy_from_slice(&s.as_bytes()[..count]);
        self.len += count;
        Ok(())
    }
}


fn write_raw_frame(
    line: &mut LineBuffer,
    idx: usize,
    frame: &RawFrame,
    module: Option<&str>,
) -> fmt::Result {
    write!(
        line,
        "#{idx:<2} {:#018x} in {UNKNOWN_NAME} at {UNKNOWN_LOCATION}",
        frame.addr
    )?;
    if let Some(module) = module {
        write!(line, " ({module})")?;
    }
    writeln!(line)
}

fn write_signal(line: &mut LineBuffer, signal: i32, fault_addr: Option<Addr>) -> fmt::Result {
    write!(line, "Received signal {} ({signal})", signal_name(signal))?;
    if let Some(addr) = fault_addr {
        write!(line, ", fault address {addr:#x}")?;
    }
    writeln!(line)
}

/// Report `frames` without resolving them, and without allocating.
fn report_raw(frames: &[RawFrame], signal: Option<i32>, fault_addr: Option<Addr>) {
    let mut line = LineBuffer::new();
    let _result = writeln!(&mut line, "Stack trace (most recent call first, unresolved):");
    let () = line.flush();

    for (idx, frame) in frames.iter().enumerate() {
        let module = sys::module_name(frame.lookup_addr());
        let module = module.and_then(|module| str::from_utf8(module).ok());
        let _result = write_raw_frame(&mut line, idx, frame, module);
        let () = line.flush();
    }

    if frames.is_empty() {
        let _result = writeln!(&mut line, "<no frames: {}>", Reason::UnavailableCapture);
        let () = line.flush();
    }

    if let Some(signal) = signal {
        let _result = write_signal(&mut line, signal, fault_addr);
        let () = line.flush();
    }
}

/// Report the crash of the current thread, with `frames` being its
/// captured call stack.
fn report(frames: &[RawFrame], signal: Option<i32>, fault_addr: Option<Addr>) {
    if RESOLVE.load(Ordering::Relaxed) {
        let result = panic::catch_unwind(|| {
            let mut trace = Trace::from_frames(frames.to_vec());
            if let Some(signal) = signal {
                trace = trace.with_signal(signal, fault_addr);
            }

            try_with_shared(|resolver| resolver.resolve(&trace)).map(|resolved| {
                let opts = PrintOptions {
                    colorize: COLORIZE.load(Ordering::Relaxed),
                    show_snippets: SNIPPETS.load(Ordering::Relaxed),
                    ..Default::default()
                };
                print::format_nonblocking(&resolved, &opts)
            })
        });

        if let Ok(Some(text)) = result {
            let () = sys::emit(text.as_bytes());
            return
        }
    }

    let () = report_raw(frames, signal, fault_addr);
}
