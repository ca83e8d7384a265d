//! Resolution of addresses via the debug help library (`dbghelp.dll`),
//! which reads PDB files as well as exported symbols.
//!
//! The library is not thread safe. All functions here are only invoked
//! with the resolver locked.

use std::ffi::c_void;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::mem::size_of;
use std::os::windows::ffi::OsStrExt as _;
use std::os::windows::ffi::OsStringExt as _;
use std::path::PathBuf;
use std::ptr;
use std::ptr::addr_of;
use std::slice;
use std::sync::OnceLock;

use crate::log;
use crate::module::Module;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Reason;
use crate::Result;

use super::DebugSession;
use super::Lookup;
use super::Options;
use super::SymFrame;


type Handle = *mut c_void;
type Bool = i32;

const SYMOPT_DEFERRED_LOADS: u32 = 0x4;
const SYMOPT_LOAD_LINES: u32 = 0x10;
const SYMOPT_FAIL_CRITICAL_ERRORS: u32 = 0x200;
const MAX_SYM_NAME: usize = 2000;


#[repr(C)]
struct SymbolInfoW {
    size_of_struct: u32,
    type_index: u32,
    reserved: [u64; 2],
    index: u32,
    size: u32,
    mod_base: u64,
    flags: u32,
    value: u64,
    address: u64,
    register: u32,
    scope: u32,
    tag: u32,
    name_len: u32,
    max_name_len: u32,
    name: [u16; 1],
}

#[repr(C)]
struct SymbolBuffer {
    info: SymbolInfoW,
    name: [u16; MAX_SYM_NAME],
}

#[repr(C)]
struct ImagehlpLineW64 {
    size_of_struct: u32,
    key: *mut c_void,
    line_number: u32,
    file_name: *mut u16,
    address: u64,
}

#[link(name = "dbghelp")]
extern "system" {
    fn SymInitializeW(process: Handle, search_path: *const u16, invade: Bool) -> Bool;
    fn SymSetOptions(options: u32) -> u32;
    fn SymLoadModuleExW(
        process: Handle,
        file: Handle,
        image_name: *const u16,
        module_name: *const u16,
        base: u64,
        size: u32,
        data: *const c_void,
        flags: u32,
    ) -> u64;
    fn SymUnloadModule64(process: Handle, base: u64) -> Bool;
    fn SymFromAddrW(
        process: Handle,
        addr: u64,
        displacement: *mut u64,
        symbol: *mut SymbolInfoW,
    ) -> Bool;
    fn SymGetLineFromAddrW64(
        process: Handle,
        addr: u64,
        displacement: *mut u32,
        line: *mut ImagehlpLineW64,
    ) -> Bool;
    fn SymAddrIncludeInlineTrace(process: Handle, addr: u64) -> u32;
    fn SymQueryInlineTrace(
        process: Handle,
        start_addr: u64,
        start_context: u32,
        start_ret_addr: u64,
        cur_addr: u64,
        cur_context: *mut u32,
        cur_frame_index: *mut u32,
    ) -> Bool;
    fn SymFromInlineContextW(
        process: Handle,
        addr: u64,
        inline_context: u32,
        displacement: *mut u64,
        symbol: *mut SymbolInfoW,
    ) -> Bool;
    fn SymGetLineFromInlineContextW(
        process: Handle,
        addr: u64,
        inline_context: u32,
        module_base: u64,
        displacement: *mut u32,
        line: *mut ImagehlpLineW64,
    ) -> Bool;
}

#[link(name = "kernel32")]
extern "system" {
    fn GetCurrentProcess() -> Handle;
}


/// Initialize the debug help library for the current process, once.
fn initialize() -> Result<()> {
    static INITIALIZED: OnceLock<bool> = OnceLock::new();

    let initialized = *INITIALIZED.get_or_init(|| {
        // SAFETY: These functions are always safe to call.
        let () = unsafe {
            let _prev =
                SymSetOptions(SYMOPT_DEFERRED_LOADS | SYMOPT_LOAD_LINES | SYMOPT_FAIL_CRITICAL_ERRORS);
        };
        // SAFETY: A NULL search path is permitted. We do not enumerate
        //         modules, as we load them on demand.
        let rc = unsafe { SymInitializeW(GetCurrentProcess(), ptr::null(), 0) };
        if rc == 0 {
            log::warn!(
                "failed to initialize debug help library: {}",
                io::Error::last_os_error()
            );
        }
        rc != 0
    });

    if initialized {
        Ok(())
    } else {
        Err(Error::with_unsupported(
            "debug help library could not be initialized",
        ))
    }
}

fn wide_str(name: &[u16]) -> String {
    let len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
    OsString::from_wide(&name[..len])
        .to_string_lossy()
        .into_owned()
}

/// Convert a NUL terminated wide string into a path.
///
/// # Safety
/// `ptr` has to point to a valid, NUL terminated wide string.
unsafe fn wide_path(ptr: *const u16) -> PathBuf {
    let mut len = 0;
    // SAFETY: Guaranteed by the caller.
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    // SAFETY: We just determined the string's length.
    let wide = unsafe { slice::from_raw_parts(ptr, len) };
    PathBuf::from(OsString::from_wide(wide))
}


fn symbol_buffer() -> Box<SymbolBuffer> {
    // SAFETY: The buffer consists of plain integers, for which all zeroes
    //         is a valid bit pattern.
    let mut buffer = Box::new(unsafe { mem::zeroed::<SymbolBuffer>() });
    buffer.info.size_of_struct = size_of::<SymbolInfoW>() as u32;
    buffer.info.max_name_len = MAX_SYM_NAME as u32;
    buffer
}

fn symbol_name(buffer: &SymbolBuffer) -> String {
    let len = (buffer.info.name_len as usize).min(MAX_SYM_NAME);
    let ptr = addr_of!(buffer.info.name).cast::<u16>();
    // SAFETY: The name is stored in place, starting at `info.name` and
    //         extending into the buffer following it, which is large
    //         enough for `len` characters.
    let name = unsafe { slice::from_raw_parts(ptr, len) };
    wide_str(name)
}

fn line_info() -> ImagehlpLineW64 {
    ImagehlpLineW64 {
        size_of_struct: size_of::<ImagehlpLineW64>() as u32,
        key: ptr::null_mut(),
        line_number: 0,
        file_name: ptr::null_mut(),
        address: 0,
    }
}

fn frame_location(line: &ImagehlpLineW64, frame: &mut SymFrame) {
    if !line.file_name.is_null() {
        // SAFETY: The library provides a NUL terminated file name.
        frame.file = Some(unsafe { wide_path(line.file_name) });
        frame.line = Some(line.line_number);
    }
}


/// A debug session for a module loaded into the debug help library.
#[derive(Debug)]
pub(crate) struct Session {
    /// The base address the module was loaded at.
    base: u64,
    /// Whether we loaded the module and have to unload it.
    loaded: bool,
    debug_info: bool,
    symbol_table: bool,
}

impl Session {
    fn inline_frames(&self, process: Handle, addr: u64) -> Vec<SymFrame> {
        let mut frames = Vec::new();

        // SAFETY: The library is initialized.
        let count = unsafe { SymAddrIncludeInlineTrace(process, addr) };
        if count == 0 {
            return frames
        }

        let mut context = 0;
        let mut frame_idx = 0;
        // SAFETY: The out pointers are valid.
        let rc = unsafe {
            SymQueryInlineTrace(process, addr, 0, addr, addr, &mut context, &mut frame_idx)
        };
        if rc == 0 {
            return frames
        }

        let mut buffer = symbol_buffer();
        for _ in 0..count {
            let mut frame = SymFrame::default();
            let mut displacement = 0u64;
            // SAFETY: The buffer is properly sized and initialized.
            let rc = unsafe {
                SymFromInlineContextW(process, addr, context, &mut displacement, &mut buffer.info)
            };
            if rc != 0 {
                frame.name = Some(symbol_name(&buffer));
            }

            let mut line = line_info();
            let mut displacement = 0u32;
            // SAFETY: The line structure is properly initialized.
            let rc = unsafe {
                SymGetLineFromInlineContextW(
                    process,
                    addr,
                    context,
                    0,
                    &mut displacement,
                    &mut line,
                )
            };
            if rc != 0 {
                let () = frame_location(&line, &mut frame);
            }

            let () = frames.push(frame);
            context += 1;
        }
        frames
    }
}

impl DebugSession for Session {
    fn open(module: &Module, opts: &Options) -> Result<Self> {
        let () = initialize()?;

        let path = module
            .file()
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect::<Vec<u16>>();
        let size = u32::try_from(module.end - module.base).unwrap_or(u32::MAX);
        // SAFETY: The library is initialized and `path` is NUL
        //         terminated.
        let base = unsafe {
            SymLoadModuleExW(
                GetCurrentProcess(),
                ptr::null_mut(),
                path.as_ptr(),
                ptr::null(),
                module.base as u64,
                size,
                ptr::null(),
                0,
            )
        };

        let loaded = if base == 0 {
            let err = io::Error::last_os_error();
            // The module may have been loaded already, in which case
            // the function reports failure with a zero error code.
            if err.raw_os_error() != Some(0) {
                return Err(err).with_context(|| {
                    format!("failed to load symbols of {}", module.path.display())
                })
            }
            false
        } else {
            true
        };

        let slf = Self {
            base: module.base as u64,
            loaded,
            debug_info: opts.debug_info,
            symbol_table: opts.symbol_table,
        };
        Ok(slf)
    }

    fn lookup(&self, _module: &Module, addr: Addr) -> Result<Lookup, Reason> {
        // SAFETY: Always safe to call.
        let process = unsafe { GetCurrentProcess() };
        let addr = addr as u64;

        let mut buffer = symbol_buffer();
        let mut displacement = 0u64;
        // SAFETY: The buffer is properly sized and initialized.
        let rc = unsafe { SymFromAddrW(process, addr, &mut displacement, &mut buffer.info) };
        let name = (rc != 0).then(|| symbol_name(&buffer));

        let mut frames = Vec::new();
        if self.debug_info {
            frames = self.inline_frames(process, addr);

            let mut frame = SymFrame {
                name: name.clone(),
                ..Default::default()
            };
            let mut line = line_info();
            let mut displacement = 0u32;
            // SAFETY: The line structure is properly initialized.
            let rc = unsafe { SymGetLineFromAddrW64(process, addr, &mut displacement, &mut line) };
            if rc != 0 {
                let () = frame_location(&line, &mut frame);
            }
            if frame.name.is_some() || frame.file.is_some() {
                let () = frames.push(frame);
            }
        }

        let object_function = if self.symbol_table { name } else { None };
        if frames.is_empty() && object_function.is_none() {
            return Err(Reason::UnknownAddr)
        }

        let lookup = Lookup {
            frames,
            object_function,
        };
        Ok(lookup)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.loaded {
            // SAFETY: We loaded the module at this base address.
            let _rc = unsafe { SymUnloadModule64(GetCurrentProcess(), self.base) };
        }
    }
}
