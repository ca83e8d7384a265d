//! Source locations and inlined frames from DWARF debug information.

use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::PathBuf;
use std::sync::Arc;

use addr2line::Context;
use gimli::Dwarf;
use gimli::EndianArcSlice;
use gimli::RunTimeEndian;
use gimli::SectionId;
use object::Object as _;
use object::ObjectSection as _;

use crate::image::Image;
use crate::Addr;
use crate::Result;

use super::SymFrame;


type R = EndianArcSlice<RunTimeEndian>;


/// The DWARF debug information of one image, ready for address lookups.
pub(crate) struct DwarfContext {
    context: Context<R>,
}

impl DwarfContext {
    /// Load the DWARF sections of `image`.
    ///
    /// Section data is copied out of the image, decompressing it as
    /// necessary, so that the context does not borrow from it.
    pub fn load(image: &Image) -> Result<Self> {
        let file = image.parse()?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: SectionId| -> Result<R> {
            let data = match file.section_by_name(id.name()) {
                Some(section) => section.uncompressed_data()?,
                None => Cow::Borrowed(&[][..]),
            };
            Ok(EndianArcSlice::new(Arc::from(&*data), endian))
        };

        let dwarf = Dwarf::load(load_section)?;
        let context = Context::from_dwarf(dwarf)?;
        Ok(Self { context })
    }

    /// Find the frames covering the (file) address `addr`, innermost
    /// first.
    pub fn find_frames(&self, addr: Addr) -> Result<Vec<SymFrame>> {
        let mut frames = Vec::new();
        let mut iter = self.context.find_frames(addr as u64).skip_all_loads()?;
        while let Some(frame) = iter.next()? {
            let name = frame
                .function
                .as_ref()
                .and_then(|function| function.raw_name().ok())
                .map(|name| name.into_owned());
            let location = frame.location;
            let frame = SymFrame {
                name,
                file: location
                    .as_ref()
                    .and_then(|location| location.file)
                    .map(PathBuf::from),
                line: location.as_ref().and_then(|location| location.line),
                column: location.as_ref().and_then(|location| location.column),
            };
            let () = frames.push(frame);
        }
        Ok(frames)
    }
}

impl Debug for DwarfContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DwarfContext").finish_non_exhaustive()
    }
}
