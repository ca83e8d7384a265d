use std::ffi::CStr;
use std::mem::size_of;
use std::path::PathBuf;
use std::slice;

use object::macho::MachHeader64;
use object::read::macho::MachHeader as _;
use object::read::macho::Segment as _;
use object::Endianness;

use crate::util::bytes_to_os_str;
use crate::Addr;
use crate::Result;

use super::Module;
use super::Segment;


/// Describe the image with index `idx` as known to the dynamic linker.
fn image_module(idx: u32) -> Option<Module> {
    // SAFETY: `_dyld_get_image_name` is safe to call with any index.
    let name = unsafe { libc::_dyld_get_image_name(idx) };
    if name.is_null() {
        return None
    }
    // SAFETY: The dynamic linker hands out valid NUL terminated strings.
    let path = PathBuf::from(bytes_to_os_str(unsafe { CStr::from_ptr(name) }.to_bytes()));

    // SAFETY: `_dyld_get_image_header` is safe to call with any index.
    let header = unsafe { libc::_dyld_get_image_header(idx) }.cast::<MachHeader64<Endianness>>();
    if header.is_null() {
        return None
    }
    // SAFETY: The header of a loaded image is mapped and readable.
    let header_ref = unsafe { &*header };
    let endian = header_ref.endian().ok()?;

    let len = size_of::<MachHeader64<Endianness>>() + header_ref.sizeofcmds(endian) as usize;
    // SAFETY: Load commands are mapped right after the header.
    let data = unsafe { slice::from_raw_parts(header.cast::<u8>(), len) };
    // SAFETY: `_dyld_get_image_vmaddr_slide` is safe to call with any index.
    let slide = unsafe { libc::_dyld_get_image_vmaddr_slide(idx) } as Addr;

    let mut segments = Vec::new();
    let mut commands = header_ref.load_commands(endian, data, 0).ok()?;
    while let Some(command) = commands.next().ok()? {
        let segment = match command.segment_64().ok()? {
            Some((segment, _section_data)) => segment,
            None => continue,
        };
        // `__PAGEZERO` has no file backing and no access rights.
        if segment.initprot(endian) == 0 && segment.filesize(endian) == 0 {
            continue
        }

        let start = (segment.vmaddr(endian) as Addr).wrapping_add(slide);
        let () = segments.push(Segment {
            range: start..start + segment.vmsize(endian) as Addr,
            file_offset: segment.fileoff(endian),
        });
    }

    Module::new(path.clone(), path, segments)
}

/// Enumerate the images loaded into the current process.
pub(super) fn enumerate() -> Result<Vec<Module>> {
    // SAFETY: `_dyld_image_count` is always safe to call.
    let count = unsafe { libc::_dyld_image_count() };
    let modules = (0..count).filter_map(image_module).collect();
    Ok(modules)
}
