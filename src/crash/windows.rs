use std::ffi::c_int;
use std::ffi::c_void;
use std::io;
use std::io::Write as _;
use std::ptr;

use crate::capture::capture_from_into;
use crate::log;
use crate::Addr;
use crate::Error;
use crate::Result;

use super::frame_buffer;
use super::report;
use super::trigger;
use super::CrashConfig;


const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;


/// `EXCEPTION_RECORD`
#[repr(C)]
pub(crate) struct ExceptionRecord {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: *mut ExceptionRecord,
    pub exception_address: *mut c_void,
    pub number_parameters: u32,
    pub exception_information: [usize; 15],
}

/// `EXCEPTION_POINTERS`
#[repr(C)]
pub(crate) struct ExceptionPointers {
    pub exception_record: *mut ExceptionRecord,
    pub context_record: *mut c_void,
}

type TopLevelExceptionFilter = unsafe extern "system" fn(*const ExceptionPointers) -> i32;

#[link(name = "kernel32")]
extern "system" {
    fn SetUnhandledExceptionFilter(
        filter: Option<TopLevelExceptionFilter>,
    ) -> Option<TopLevelExceptionFilter>;
}


pub(super) fn emit(bytes: &[u8]) {
    let _result = io::stderr().write_all(bytes);
}

pub(super) fn module_name(_addr: Addr) -> Option<&'static [u8]> {
    None
}


/// Map a structured exception onto the closest signal, along with the
/// faulting data address, if any.
fn exception_signal(record: &ExceptionRecord) -> Option<(i32, Option<Addr>)> {
    match record.exception_code {
        EXCEPTION_ACCESS_VIOLATION | EXCEPTION_IN_PAGE_ERROR => {
            let addr = (record.number_parameters >= 2).then(|| record.exception_information[1]);
            Some((libc::SIGSEGV, addr))
        }
        EXCEPTION_STACK_OVERFLOW => Some((libc::SIGSEGV, None)),
        EXCEPTION_ILLEGAL_INSTRUCTION | EXCEPTION_PRIV_INSTRUCTION => Some((libc::SIGILL, None)),
        EXCEPTION_INT_DIVIDE_BY_ZERO => Some((libc::SIGFPE, None)),
        code if (0xC000_008D..=0xC000_0093).contains(&code) => Some((libc::SIGFPE, None)),
        _ => None,
    }
}

unsafe extern "system" fn handle_exception(pointers: *const ExceptionPointers) -> i32 {
    if trigger() {
        // SAFETY: We just moved into the triggered state.
        let frames = unsafe { frame_buffer() };
        // SAFETY: `pointers` is provided by the system.
        let count = unsafe { capture_from_into(pointers.cast(), frames) };

        // SAFETY: The system provides valid exception pointers.
        let record = unsafe { pointers.as_ref() }
            .and_then(|pointers| unsafe { pointers.exception_record.as_ref() });
        match record.and_then(exception_signal) {
            Some((signal, fault_addr)) => {
                let () = report(&frames[..count], Some(signal), fault_addr);
            }
            None => {
                let () = report(&frames[..count], None, None);
                if let Some(record) = record {
                    let text = format!("Unhandled exception {:#x}\n", record.exception_code);
                    let () = emit(text.as_bytes());
                }
            }
        }
    }
    // Let the system terminate the process.
    EXCEPTION_CONTINUE_SEARCH
}

extern "C" fn handle_signal(signal: c_int) {
    if trigger() {
        // SAFETY: We just moved into the triggered state.
        let frames = unsafe { frame_buffer() };
        // SAFETY: A NULL context is permitted.
        let count = unsafe { capture_from_into(ptr::null(), frames) };
        let () = report(&frames[..count], Some(signal), None);
    }

    // SAFETY: Always safe to call.
    unsafe {
        let _prev = libc::signal(signal, libc::SIG_DFL);
        let _rc = libc::raise(signal);
    }
}


/// The state of an installed crash handler.
pub(super) struct Installation {
    prior_filter: Option<TopLevelExceptionFilter>,
    prior_signals: Vec<(c_int, libc::sighandler_t)>,
}

impl Installation {
    pub(super) fn new(config: &CrashConfig) -> Result<Self> {
        let mut prior_signals = Vec::with_capacity(config.signals.len());
        for &signal in &config.signals {
            // SAFETY: The handler has the signature expected by the C
            //         runtime.
            let prior = unsafe { libc::signal(signal, handle_signal as libc::sighandler_t) };
            if prior == libc::SIG_ERR {
                for (signal, prior) in prior_signals {
                    // SAFETY: Restores a handler reported by the C runtime.
                    let _prev = unsafe { libc::signal(signal, prior) };
                }
                return Err(Error::from(io::Error::last_os_error()))
            }
            let () = prior_signals.push((signal, prior));
        }

        // SAFETY: Always safe to call.
        let prior_filter = unsafe { SetUnhandledExceptionFilter(Some(handle_exception)) };

        log::debug!("installed crash handler for signals {:?}", config.signals);
        let slf = Self {
            prior_filter,
            prior_signals,
        };
        Ok(slf)
    }

    pub(super) fn uninstall(self) -> Result<()> {
        // SAFETY: Always safe to call.
        let _filter = unsafe { SetUnhandledExceptionFilter(self.prior_filter) };
        for (signal, prior) in self.prior_signals.into_iter().rev() {
            // SAFETY: Restores a handler reported by the C runtime.
            let _prev = unsafe { libc::signal(signal, prior) };
        }
        Ok(())
    }
}
