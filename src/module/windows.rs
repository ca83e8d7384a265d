use std::ffi::c_void;
use std::ffi::OsString;
use std::io;
use std::mem::size_of;
use std::os::windows::ffi::OsStringExt as _;
use std::path::PathBuf;
use std::ptr;

use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Result;

use super::Module;
use super::Segment;


type Handle = *mut c_void;
type Hmodule = *mut c_void;

#[repr(C)]
struct ModuleInfo {
    base_of_dll: *mut c_void,
    size_of_image: u32,
    entry_point: *mut c_void,
}

#[link(name = "kernel32")]
extern "system" {
    fn GetCurrentProcess() -> Handle;
    fn K32EnumProcessModules(
        process: Handle,
        modules: *mut Hmodule,
        cb: u32,
        needed: *mut u32,
    ) -> i32;
    fn K32GetModuleInformation(
        process: Handle,
        module: Hmodule,
        info: *mut ModuleInfo,
        cb: u32,
    ) -> i32;
    fn K32GetModuleFileNameExW(
        process: Handle,
        module: Hmodule,
        filename: *mut u16,
        size: u32,
    ) -> u32;
}


fn module_handles(process: Handle) -> Result<Vec<Hmodule>> {
    let mut handles = Vec::<Hmodule>::new();
    loop {
        let mut needed = 0u32;
        let cb = (handles.len() * size_of::<Hmodule>()) as u32;
        // SAFETY: The buffer is valid for `cb` bytes.
        let rc = unsafe { K32EnumProcessModules(process, handles.as_mut_ptr(), cb, &mut needed) };
        if rc == 0 {
            return Err(Error::from(io::Error::last_os_error()))
                .context("failed to enumerate process modules")
        }

        let count = needed as usize / size_of::<Hmodule>();
        if count <= handles.len() {
            let () = handles.truncate(count);
            return Ok(handles)
        }
        let () = handles.resize(count, ptr::null_mut());
    }
}

fn module_path(process: Handle, handle: Hmodule) -> Option<PathBuf> {
    let mut buf = vec![0u16; 1024];
    loop {
        // SAFETY: The buffer is valid for `buf.len()` wide characters.
        let len = unsafe {
            K32GetModuleFileNameExW(process, handle, buf.as_mut_ptr(), buf.len() as u32)
        } as usize;
        if len == 0 {
            return None
        }
        if len < buf.len() {
            let path = OsString::from_wide(&buf[..len]);
            return Some(PathBuf::from(path))
        }
        let () = buf.resize(buf.len() * 2, 0);
    }
}

/// Enumerate the modules loaded into the current process.
pub(super) fn enumerate() -> Result<Vec<Module>> {
    // SAFETY: `GetCurrentProcess` returns a pseudo handle and is always
    //         safe to call.
    let process = unsafe { GetCurrentProcess() };
    let handles = module_handles(process)?;

    let modules = handles
        .into_iter()
        .filter_map(|handle| {
            let mut info = ModuleInfo {
                base_of_dll: ptr::null_mut(),
                size_of_image: 0,
                entry_point: ptr::null_mut(),
            };
            // SAFETY: `info` is a valid out-parameter of the given size.
            let rc = unsafe {
                K32GetModuleInformation(process, handle, &mut info, size_of::<ModuleInfo>() as u32)
            };
            if rc == 0 {
                return None
            }

            let path = module_path(process, handle)?;
            let base = info.base_of_dll as Addr;
            let segment = Segment {
                range: base..base + info.size_of_image as Addr,
                file_offset: 0,
            };
            Module::new(path.clone(), path, vec![segment])
        })
        .collect();
    Ok(modules)
}
