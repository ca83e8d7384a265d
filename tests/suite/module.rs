use std::env::current_exe;
use std::hint::black_box;

use crashtrace::module::ModuleIndex;
use crashtrace::Addr;

use test_log::test;


#[inline(never)]
fn indexed_function() -> usize {
    black_box(1337)
}


/// Check that a function of the test binary is attributed to the main
/// executable.
#[cfg(any(target_os = "linux", target_vendor = "apple", windows))]
#[test]
fn find_own_module() {
    let addr = indexed_function as Addr;
    let mut index = ModuleIndex::new();
    let module = index.find(addr).unwrap();
    assert!(module.contains(addr));
    assert!(module.base <= addr && addr < module.end);

    let exe = current_exe().unwrap();
    assert_eq!(
        module.path.file_name(),
        exe.file_name(),
        "{}",
        module.path.display()
    );
    assert_eq!(module.name, exe.file_name().unwrap().to_string_lossy());
}

/// Check that modules are reported sorted and without overlap.
#[test]
fn module_ordering() {
    let mut index = ModuleIndex::new();
    let modules = index.modules().to_vec();

    for pair in modules.windows(2) {
        assert!(pair[0].base < pair[0].end);
        assert!(pair[0].end <= pair[1].base, "{:?}", pair);
    }

    for module in &modules {
        let found = index.find(module.base).unwrap();
        assert_eq!(found.base, module.base);
        assert_eq!(found.path, module.path);
    }
}

/// Make sure that addresses outside of all modules are not attributed
/// to a neighbor.
#[test]
fn find_unknown_address() {
    let mut index = ModuleIndex::new();
    assert_eq!(index.find(0), None);
    assert_eq!(index.find(Addr::MAX), None);
    // The index stays usable after the failed lookups triggered a
    // rebuild.
    let addr = indexed_function as Addr;
    if cfg!(any(target_os = "linux", target_vendor = "apple", windows)) {
        assert!(index.find(addr).is_some());
    }
}
