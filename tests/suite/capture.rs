use std::hint::black_box;

use crashtrace::capture;
use crashtrace::capture::MAX_CAPTURE_DEPTH;
use crashtrace::capture_trace;
use crashtrace::resolve;
use crashtrace::Addr;
use crashtrace::ErrorKind;
use crashtrace::RawFrame;
use crashtrace::Trace;

use test_log::test;


#[inline(never)]
fn faulting_function(max_depth: usize) -> Trace {
    black_box(capture_trace(max_depth).unwrap())
}

#[inline(never)]
fn helper(max_depth: usize) -> Trace {
    black_box(faulting_function(black_box(max_depth)))
}

#[inline(never)]
fn entry(max_depth: usize) -> Trace {
    black_box(helper(black_box(max_depth)))
}


/// Check that captured traces honor the requested depth.
#[test]
fn capture_depth() {
    for max_depth in [1, 2, 3, 10, MAX_CAPTURE_DEPTH] {
        let trace = entry(max_depth);
        assert!(trace.len() <= max_depth, "{} > {max_depth}", trace.len());
        assert_eq!(trace.max_depth(), max_depth);
    }

    let err = capture_trace(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = capture_trace(MAX_CAPTURE_DEPTH + 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

/// Check that the capturing functions do not show up in a trace and that
/// it starts with the innermost frame of the call chain.
#[cfg(any(target_os = "linux", target_vendor = "apple"))]
#[test]
fn capture_call_chain() {
    let trace = entry(10);
    assert!(trace.len() >= 3);
    assert!(trace.len() <= 10);

    let names = trace
        .iter()
        .take(3)
        .map(|frame| {
            let resolved = resolve(&Trace::from_frames(vec![*frame]));
            resolved
                .iter()
                .last()
                .and_then(|frame| frame.name())
                .map(str::to_string)
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();

    assert!(names[0].ends_with("faulting_function"), "{names:?}");
    assert!(names[1].ends_with("helper"), "{names:?}");
    assert!(names[2].ends_with("entry"), "{names:?}");
}

/// Make sure that skipping frames removes innermost frames only.
#[test]
fn capture_skip() {
    #[inline(never)]
    fn capture_both() -> (Trace, Trace) {
        let full = capture::capture(16, 0).unwrap();
        let skipped = capture::capture(16, 1).unwrap();
        black_box((full, skipped))
    }

    let (full, skipped) = capture_both();
    if full.len() < 3 {
        // The platform cannot walk the stack.
        return
    }
    // The innermost frames are return addresses inside `capture_both`,
    // which differ between the two captures.
    assert_eq!(full.frames()[1..], skipped.frames()[..full.len() - 1]);
}

/// Check that frames of foreign origin can be wrapped in a trace.
#[test]
fn foreign_frames() {
    let frames = vec![RawFrame::new(0x1000), RawFrame::new(0x2000)];
    let trace = Trace::from_frames(frames.clone());
    assert_eq!(trace.frames(), frames.as_slice());
    assert_eq!(trace.len(), 2);
    assert_eq!(trace.max_depth(), 2);
    assert_eq!(trace.signal(), None);
    assert_eq!(trace[1].lookup_addr(), 0x2000 as Addr - 1);
}
