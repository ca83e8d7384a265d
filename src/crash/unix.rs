use std::ffi::c_int;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::mem::MaybeUninit;
use std::ptr;

use crate::capture::capture_from_into;
use crate::log;
use crate::resolve::dladdr;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Result;

use super::frame_buffer;
use super::report;
use super::trigger;
use super::CrashConfig;


/// Write `bytes` to standard error, using only async-signal-safe
/// functionality.
pub(super) fn emit(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: The pointer and length describe a valid slice.
        let rc = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if rc < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue
            }
            break
        }
        if rc == 0 {
            break
        }
        bytes = &bytes[rc as usize..];
    }
}

/// Retrieve the path of the module containing `addr`, as known to the
/// dynamic loader.
pub(super) fn module_name(addr: Addr) -> Option<&'static [u8]> {
    dladdr(addr)
        .and_then(|info| info.file)
        .map(|file| file.to_bytes())
        .filter(|file| !file.is_empty())
}


#[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
fn fault_addr(signal: c_int, info: *const libc::siginfo_t) -> Option<Addr> {
    if info.is_null()
        || !matches!(
            signal,
            libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE
        )
    {
        return None
    }

    // SAFETY: `info` is provided by the system and for the signals
    //         above it contains the faulting address.
    let addr = unsafe { (*info).si_addr() };
    Some(addr as Addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
fn fault_addr(_signal: c_int, _info: *const libc::siginfo_t) -> Option<Addr> {
    None
}

/// Restore the default disposition of `signal` and raise it again.
fn reraise(signal: c_int) -> ! {
    // SAFETY: These functions are async-signal-safe and always safe to
    //         call.
    unsafe {
        let _prev = libc::signal(signal, libc::SIG_DFL);
        let _rc = libc::raise(signal);
        // The signal may be ignored or blocked by default. We must not
        // return in any case.
        libc::_exit(128 + signal)
    }
}

extern "C" fn handle_signal(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    if trigger() {
        // SAFETY: We just moved into the triggered state.
        let frames = unsafe { frame_buffer() };
        // SAFETY: `context` is the `ucontext_t` provided by the system.
        let count = unsafe { capture_from_into(context, frames) };
        let () = report(&frames[..count], Some(signal), fault_addr(signal, info));
    }
    reraise(signal)
}


/// An alternate signal stack registered for the installing thread.
struct AltStack {
    memory: Box<[u8]>,
    /// The alternate stack that was registered before ours.
    prior: libc::stack_t,
}

// SAFETY: `stack_t` merely describes memory, it does not own it.
unsafe impl Send for AltStack {}

impl AltStack {
    fn install(size: usize) -> Result<Self> {
        let size = size.max(libc::SIGSTKSZ);
        let mut memory = vec![0; size].into_boxed_slice();
        let stack = libc::stack_t {
            ss_sp: memory.as_mut_ptr().cast(),
            ss_flags: 0,
            ss_size: size,
        };

        let mut prior = MaybeUninit::<libc::stack_t>::uninit();
        // SAFETY: Both pointers are valid and the stack memory outlives
        //         the registration, see `uninstall`.
        let rc = unsafe { libc::sigaltstack(&stack, prior.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error())
                .context("failed to register alternate signal stack")
        }
        // SAFETY: `sigaltstack` succeeded and initialized `prior`.
        let prior = unsafe { prior.assume_init() };

        let slf = Self { memory, prior };
        Ok(slf)
    }

    fn uninstall(mut self) {
        let mut current = MaybeUninit::<libc::stack_t>::uninit();
        // SAFETY: A NULL new stack is permitted, `current` is valid for
        //         writes.
        let rc = unsafe { libc::sigaltstack(ptr::null(), current.as_mut_ptr()) };
        if rc == 0 {
            // SAFETY: `sigaltstack` succeeded and initialized `current`.
            let current = unsafe { current.assume_init() };
            if current.ss_sp == self.memory.as_mut_ptr().cast() {
                self.prior.ss_flags &= !libc::SS_ONSTACK;
                // SAFETY: `prior` was reported by the system.
                let rc = unsafe { libc::sigaltstack(&self.prior, ptr::null_mut()) };
                if rc == 0 {
                    return
                }
            }
        }

        // The stack may still be registered, for example because we are
        // running on a different thread than the one that installed it.
        log::debug!("leaking alternate signal stack that may still be in use");
        let _memory = Box::leak(self.memory);
    }
}


/// The state of an installed crash handler.
pub(super) struct Installation {
    /// The signal actions in place before ours.
    prior: Vec<(c_int, libc::sigaction)>,
    alt_stack: Option<AltStack>,
}

impl Installation {
    pub(super) fn new(config: &CrashConfig) -> Result<Self> {
        let alt_stack = if config.alt_stack_size > 0 {
            Some(AltStack::install(config.alt_stack_size)?)
        } else {
            None
        };

        let mut slf = Self {
            prior: Vec::with_capacity(config.signals.len()),
            alt_stack,
        };

        // SAFETY: `sigaction` is a plain C struct for which all zeroes
        //         is a valid bit pattern.
        let mut action = unsafe { mem::zeroed::<libc::sigaction>() };
        action.sa_sigaction = handle_signal as libc::sighandler_t;
        action.sa_flags =
            libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER | libc::SA_RESETHAND;
        // SAFETY: The mask is valid for writes.
        let _rc = unsafe { libc::sigemptyset(&mut action.sa_mask) };

        for &signal in &config.signals {
            let mut prior = MaybeUninit::<libc::sigaction>::uninit();
            // SAFETY: Both pointers are valid.
            let rc = unsafe { libc::sigaction(signal, &action, prior.as_mut_ptr()) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                // Leave the system the way we found it.
                let _result = slf.uninstall();
                return Err(err).with_context(|| format!("failed to install handler for signal {signal}"))
            }
            // SAFETY: `sigaction` succeeded and initialized `prior`.
            let prior = unsafe { prior.assume_init() };
            let () = slf.prior.push((signal, prior));
        }

        log::debug!("installed crash handler for signals {:?}", config.signals);
        Ok(slf)
    }

    pub(super) fn uninstall(self) -> Result<()> {
        let mut result = Ok(());

        for (signal, prior) in self.prior.iter().rev() {
            // SAFETY: The action was reported by the system earlier.
            let rc = unsafe { libc::sigaction(*signal, prior, ptr::null_mut()) };
            if rc != 0 && result.is_ok() {
                result = Err(io::Error::last_os_error())
                    .with_context(|| format!("failed to restore handler for signal {signal}"));
            }
        }

        if let Some(alt_stack) = self.alt_stack {
            let () = alt_stack.uninstall();
        }
        result
    }
}
