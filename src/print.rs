//! Rendering of resolved stack traces as text.
//!
//! Every frame is rendered as a header line of the form
//!
//! ```text
//! #3  0x000055f1c1a4b2c7 in app::main at src/main.rs:12:5
//! ```
//!
//! optionally followed by a snippet of the source code surrounding the
//! frame's location. Missing information is rendered as a placeholder.

use std::fmt::Display;
use std::fmt::Result as FmtResult;
use std::fmt::Write;
use std::io;
use std::path::Path;

use yansi::Condition;
use yansi::Paint as _;
use yansi::Style;

use crate::crash::signal_name;
use crate::resolve::ResolvedFrame;
use crate::resolve::ResolvedTrace;
use crate::source;
use crate::source::SourceCache;
use crate::Reason;


/// The placeholder used for an unknown function name.
pub const UNKNOWN_NAME: &str = "?";
/// The placeholder used for an unknown source location.
pub const UNKNOWN_LOCATION: &str = "??:0";

/// The maximum number of characters of a file path to print.
const MAX_PATH_CHARS: usize = 45;

const INDEX_STYLE: Style = Style::new().red().bold();
const ADDR_STYLE: Style = Style::new().dim();
const NAME_STYLE: Style = Style::new().yellow();
const INLINE_STYLE: Style = Style::new().magenta();
const LOCATION_STYLE: Style = Style::new().green();
const MODULE_STYLE: Style = Style::new().cyan();
const FOCUS_STYLE: Style = Style::new().bright_yellow().bold();
const CONTEXT_STYLE: Style = Style::new().bright_black();
const HEADER_STYLE: Style = Style::new().red().bold();


/// Options controlling the rendering of a trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrintOptions {
    /// Whether to emit ANSI color codes.
    pub colorize: bool,
    /// Whether to print source code snippets.
    pub show_snippets: bool,
    /// The number of lines to show before and after the line of a
    /// frame.
    pub snippet_context_radius: u32,
    /// The number of lines to show before and after the line of an
    /// inlined frame.
    pub inline_context_radius: u32,
    /// Whether to always print the path of the module a frame belongs
    /// to. It is printed for frames without source location regardless.
    pub show_module: bool,
    /// Whether to print the most recent call last.
    pub reverse: bool,
    /// Whether to print a header line before the frames.
    pub header: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            colorize: false,
            show_snippets: false,
            snippet_context_radius: 3,
            inline_context_radius: 2,
            show_module: false,
            reverse: false,
            header: true,
        }
    }
}


/// Shorten `path` to at most [`MAX_PATH_CHARS`] characters by cutting
/// off its beginning.
fn truncate_path(path: &Path) -> String {
    let path = path.display().to_string();
    let count = path.chars().count();
    if count <= MAX_PATH_CHARS {
        return path
    }

    let tail = path
        .chars()
        .skip(count - (MAX_PATH_CHARS - 3))
        .collect::<String>();
    format!("...{tail}")
}


struct Printer<'opts> {
    opts: &'opts PrintOptions,
    /// The source cache to use, if any.
    cache: Option<&'opts SourceCache>,
    /// Whether to wait for the source cache to become available.
    blocking: bool,
    condition: Condition,
}

impl Printer<'_> {
    fn paint<T>(&self, value: T, style: Style) -> String
    where
        T: Display,
    {
        value.paint(style.whenever(self.condition)).to_string()
    }

    fn write_header<W>(&self, w: &mut W, trace: &ResolvedTrace) -> FmtResult
    where
        W: Write,
    {
        let order = if self.opts.reverse {
            "most recent call last"
        } else {
            "most recent call first"
        };
        let thread = if trace.thread_id() != 0 {
            format!(" in thread {}", trace.thread_id())
        } else {
            String::new()
        };
        let header = format!("Stack trace ({order}){thread}:");
        writeln!(w, "{}", self.paint(header, HEADER_STYLE))
    }

    fn write_snippet<W>(&self, w: &mut W, path: &Path, line: u32, radius: u32) -> FmtResult
    where
        W: Write,
    {
        let snippet = match self.cache {
            Some(cache) if self.blocking => cache.snippet(path, line, radius),
            Some(cache) => cache.try_snippet(path, line, radius),
            None => None,
        };
        let snippet = if let Some(snippet) = snippet {
            snippet
        } else {
            return Ok(())
        };

        for (number, text) in snippet.iter() {
            if number == line {
                let text = format!("    > {number:>5}: {text}");
                writeln!(w, "{}", self.paint(text, FOCUS_STYLE))?;
            } else {
                let text = format!("      {number:>5}: {text}");
                writeln!(w, "{}", self.paint(text, CONTEXT_STYLE))?;
            }
        }
        Ok(())
    }

    fn write_frame<W>(&self, w: &mut W, idx: usize, frame: &ResolvedFrame) -> FmtResult
    where
        W: Write,
    {
        let index = format!("#{idx:<2}");
        let addr = format!("{:#018x}", frame.raw_address);
        write!(
            w,
            "{} {} in ",
            self.paint(index, INDEX_STYLE),
            self.paint(addr, ADDR_STYLE)
        )?;

        if frame.is_inline {
            write!(w, "{} ", self.paint("[inlined]", INLINE_STYLE))?;
        }

        let name = frame.name().unwrap_or(UNKNOWN_NAME);
        write!(w, "{} at ", self.paint(name, NAME_STYLE))?;

        let location = match (&frame.source_file, frame.source_line) {
            (Some(file), Some(line)) => match frame.source_column {
                Some(column) if column != 0 => {
                    format!("{}:{line}:{column}", truncate_path(file))
                }
                _ => format!("{}:{line}", truncate_path(file)),
            },
            (Some(file), None) => format!("{}:0", truncate_path(file)),
            (None, _) => UNKNOWN_LOCATION.to_string(),
        };
        write!(w, "{}", self.paint(location, LOCATION_STYLE))?;

        if self.opts.show_module || frame.source_file.is_none() {
            if let Some(module) = &frame.module {
                let path = module.path.display();
                write!(w, " ({})", self.paint(path, MODULE_STYLE))?;
            }
        }
        writeln!(w)?;

        if self.opts.show_snippets {
            if let (Some(file), Some(line)) = (&frame.source_file, frame.source_line) {
                let radius = if frame.is_inline {
                    self.opts.inline_context_radius
                } else {
                    self.opts.snippet_context_radius
                };
                let () = self.write_snippet(w, file, line, radius)?;
            }
        }
        Ok(())
    }

    fn write_trace<W>(&self, w: &mut W, trace: &ResolvedTrace) -> FmtResult
    where
        W: Write,
    {
        if self.opts.header {
            let () = self.write_header(w, trace)?;
        }

        if trace.is_empty() {
            writeln!(w, "<no frames: {}>", Reason::UnavailableCapture)?;
        }

        let frames = trace.iter().enumerate();
        if self.opts.reverse {
            for (idx, frame) in frames.rev() {
                let () = self.write_frame(w, idx, frame)?;
            }
        } else {
            for (idx, frame) in frames {
                let () = self.write_frame(w, idx, frame)?;
            }
        }

        if let Some(signal) = trace.signal() {
            let mut text = format!("Received signal {} ({signal})", signal_name(signal));
            if let Some(addr) = trace.fault_addr() {
                let () = write!(&mut text, ", fault address {addr:#x}")?;
            }
            writeln!(w, "{}", self.paint(text, HEADER_STYLE))?;
        }
        Ok(())
    }
}


fn render(printer: &Printer<'_>, trace: &ResolvedTrace) -> String {
    let mut text = String::new();
    // Writing to a `String` cannot fail.
    let _result = printer.write_trace(&mut text, trace);
    text
}

fn condition(opts: &PrintOptions) -> Condition {
    if opts.colorize {
        Condition::ALWAYS
    } else {
        Condition::NEVER
    }
}

/// Render `trace` as text, using the given source cache for snippets.
pub fn format_with(trace: &ResolvedTrace, opts: &PrintOptions, cache: &SourceCache) -> String {
    let printer = Printer {
        opts,
        cache: Some(cache),
        blocking: true,
        condition: condition(opts),
    };
    render(&printer, trace)
}

/// Render `trace` as text.
///
/// Source snippets are retrieved from the process-wide
/// [`SourceCache`][source::global].
pub fn format(trace: &ResolvedTrace, opts: &PrintOptions) -> String {
    format_with(trace, opts, source::global())
}

/// Render `trace` as text without waiting for any lock.
///
/// Snippets are only included if the process-wide source cache exists
/// and is not in use by another thread.
pub(crate) fn format_nonblocking(trace: &ResolvedTrace, opts: &PrintOptions) -> String {
    let printer = Printer {
        opts,
        cache: source::try_global(),
        blocking: false,
        condition: condition(opts),
    };
    render(&printer, trace)
}

/// Render `trace` to `writer`.
pub fn print<W>(writer: &mut W, trace: &ResolvedTrace, opts: &PrintOptions) -> io::Result<()>
where
    W: io::Write + ?Sized,
{
    let text = format(trace, opts);
    writer.write_all(text.as_bytes())
}
