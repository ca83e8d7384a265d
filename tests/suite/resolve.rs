use std::hint::black_box;

use crashtrace::capture_trace;
use crashtrace::resolve;
use crashtrace::Addr;
use crashtrace::RawFrame;
use crashtrace::Reason;
use crashtrace::ResolvedFrame;
use crashtrace::Resolver;
use crashtrace::Trace;

use test_log::test;


#[inline(never)]
fn faulting_function() -> Trace {
    black_box(capture_trace(10).unwrap())
}

#[inline(never)]
fn helper() -> Trace {
    black_box(faulting_function())
}

#[inline(never)]
fn entry() -> Trace {
    black_box(helper())
}


/// Retrieve the outermost resolved frame of every raw frame.
fn outer_frames(resolver: &mut Resolver, trace: &Trace) -> Vec<ResolvedFrame> {
    trace
        .iter()
        .filter_map(|frame| {
            resolver
                .resolve(&Trace::from_frames(vec![*frame]))
                .frames()
                .last()
                .cloned()
        })
        .collect()
}


/// Check that a three frame call chain resolves to the expected function
/// names and that disabling debug information leaves only raw addresses
/// and modules.
#[cfg(any(target_os = "linux", target_vendor = "apple"))]
#[test]
fn resolve_call_chain() {
    let trace = entry();
    assert!(trace.len() >= 3);
    let trace = Trace::from_frames(trace.frames()[..3].to_vec());

    let mut resolver = Resolver::new();
    let frames = outer_frames(&mut resolver, &trace);
    assert_eq!(frames.len(), 3);

    let names = frames
        .iter()
        .map(|frame| frame.name().unwrap_or_default())
        .collect::<Vec<_>>();
    assert!(names[0].ends_with("faulting_function"), "{names:?}");
    assert!(names[1].ends_with("helper"), "{names:?}");
    assert!(names[2].ends_with("entry"), "{names:?}");

    for (raw, frame) in trace.iter().zip(&frames) {
        assert_eq!(frame.raw_address, raw.addr);
        assert_ne!(frame.module, None);
        assert_eq!(frame.reason, None);
    }

    if cfg!(all(target_os = "linux", feature = "dwarf")) {
        let file = frames[0].source_file.as_ref().unwrap();
        assert!(file.ends_with("resolve.rs"), "{}", file.display());
        assert!(frames[0].source_line.is_some());
    }

    let mut resolver = Resolver::builder()
        .enable_debug_info(false)
        .enable_symbol_table(false)
        .build();
    let stripped = resolver.resolve(&trace);
    assert_eq!(stripped.len(), 3);

    for (raw, frame) in trace.iter().zip(stripped.iter()) {
        assert_eq!(frame.raw_address, raw.addr);
        assert_ne!(frame.module, None);
        assert_eq!(frame.mangled_name, None);
        assert_eq!(frame.demangled_name, None);
        assert_eq!(frame.source_file, None);
        assert_eq!(frame.source_line, None);
        assert_eq!(frame.reason, Some(Reason::DebugInfoUnavailable));
    }
}

/// Check that resolution is deterministic, also across a rebuild of the
/// module index.
#[test]
fn resolve_determinism() {
    let trace = entry();

    let mut resolver = Resolver::new();
    let first = resolver.resolve(&trace);
    let second = resolver.resolve(&trace);
    assert_eq!(first, second);

    let () = resolver.modules().invalidate();
    let third = resolver.resolve(&trace);
    assert_eq!(first, third);

    // The shared resolver yields the same result.
    assert_eq!(resolve(&trace), first);
}

/// Make sure that addresses outside of all modules are reported as such.
#[test]
fn resolve_unknown_addresses() {
    let trace = Trace::from_frames(vec![RawFrame::new(1), RawFrame::new(Addr::MAX)]);
    let resolved = resolve(&trace);
    assert_eq!(resolved.len(), 2);

    for (raw, frame) in trace.iter().zip(resolved.iter()) {
        let expected = ResolvedFrame {
            raw_address: raw.addr,
            reason: Some(Reason::ModuleNotFound),
            ..Default::default()
        };
        assert_eq!(frame, &expected);
    }
}

/// Check that inlined frames are reported innermost first, with only the
/// last frame of a raw address not being marked as inlined.
#[test]
fn resolve_inline_marking() {
    let trace = entry();
    let resolved = resolve(&trace);
    assert!(resolved.len() >= trace.len());

    let mut frames = resolved.iter().peekable();
    while let Some(frame) = frames.next() {
        if frame.is_inline {
            let next = frames.peek().unwrap();
            assert_eq!(next.raw_address, frame.raw_address);
        }
    }
    assert!(!resolved[resolved.len() - 1].is_inline);
}
