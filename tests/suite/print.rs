use std::fs;
use std::hint::black_box;
use std::path::PathBuf;

use crashtrace::capture_trace;
use crashtrace::print;
use crashtrace::print::format_with;
use crashtrace::resolve;
use crashtrace::source::SourceCache;
use crashtrace::PrintOptions;
use crashtrace::ResolvedFrame;
use crashtrace::ResolvedTrace;

use tempfile::tempdir;
use test_log::test;


#[inline(never)]
fn printed_function(opts: &PrintOptions) -> String {
    let trace = capture_trace(8).unwrap();
    let resolved = resolve(&trace);
    black_box(print(&resolved, opts))
}


/// Check that every frame of a resolved trace results in one header
/// line.
#[test]
fn print_own_trace() {
    let opts = PrintOptions {
        header: false,
        ..Default::default()
    };
    let text = printed_function(&opts);
    let lines = text.lines().collect::<Vec<_>>();
    assert!(!lines.is_empty());

    for (idx, line) in lines.iter().enumerate() {
        let prefix = format!("#{idx:<2} 0x");
        assert!(line.starts_with(&prefix), "{line}");
        assert!(line.contains(" in "), "{line}");
        assert!(line.contains(" at "), "{line}");
    }

    if cfg!(any(target_os = "linux", target_vendor = "apple")) {
        assert!(lines[0].contains("printed_function"), "{text}");
    }
}

/// Check that source snippets of our own code are printed when
/// requested.
#[cfg(all(target_os = "linux", feature = "dwarf"))]
#[test]
fn print_own_snippet() {
    let opts = PrintOptions {
        header: false,
        show_snippets: true,
        snippet_context_radius: 1,
        ..Default::default()
    };
    let text = printed_function(&opts);
    let focus = text
        .lines()
        .find(|line| line.starts_with("    > "))
        .unwrap();
    assert!(focus.contains("capture_trace(8)"), "{text}");
}

/// Check that source files that moved are found via a prefix.
#[test]
fn print_relocated_source() {
    let dir = tempdir().unwrap();
    let () = fs::create_dir_all(dir.path().join("build/src")).unwrap();
    let () = fs::write(
        dir.path().join("build/src/moved.rs"),
        "fn a() {}\nfn b() {\n    panic!()\n}\n",
    )
    .unwrap();

    let trace = ResolvedTrace::from_frames(vec![ResolvedFrame {
        raw_address: 0x4000,
        mangled_name: Some("b".to_string()),
        source_file: Some(PathBuf::from("/build/src/moved.rs")),
        source_line: Some(3),
        ..Default::default()
    }]);
    let opts = PrintOptions {
        header: false,
        show_snippets: true,
        snippet_context_radius: 1,
        ..Default::default()
    };

    let cache = SourceCache::with_prefixes(Vec::new());
    let text = format_with(&trace, &opts, &cache);
    assert_eq!(text.lines().count(), 1);

    let () = cache.add_prefix(dir.path());
    let text = format_with(&trace, &opts, &cache);
    let expected = "\
#0  0x0000000000004000 in b at /build/src/moved.rs:3
          2: fn b() {
    >     3:     panic!()
          4: }
";
    assert_eq!(text, expected);
}
