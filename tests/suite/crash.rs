use std::env;
use std::env::current_exe;
use std::hint::black_box;
use std::process;
use std::process::Command;
use std::process::Output;
use std::ptr;

use crashtrace::crash;
use crashtrace::crash::CrashConfig;
use crashtrace::install_crash_handler;
use crashtrace::uninstall_crash_handler;

use scopeguard::defer;

use test_log::test;


/// The environment variable selecting the crash scenario to run in a
/// child process.
const CHILD_VAR: &str = "CRASHTRACE_CRASH_CHILD";


#[inline(never)]
fn faulting_function() -> u64 {
    // An unmapped address in the first page, like a field access through
    // a NULL pointer.
    let ptr = black_box(16usize) as *const u64;
    // SAFETY: Not safe at all; this is meant to crash.
    unsafe { ptr::read_volatile(ptr) }
}

#[inline(never)]
fn helper() -> u64 {
    black_box(faulting_function()) + 1
}

/// Run the crash scenario `scenario` in a child process.
fn run_child(scenario: &str) -> Output {
    Command::new(current_exe().unwrap())
        .args(["--exact", "suite::crash::crash_child", "--nocapture", "--test-threads=1"])
        .env(CHILD_VAR, scenario)
        .env("RUST_BACKTRACE", "0")
        .output()
        .unwrap()
}


/// The entry point for crashing child processes.
///
/// Without the scenario variable being set, this test does nothing.
#[test]
fn crash_child() {
    let scenario = match env::var(CHILD_VAR) {
        Ok(scenario) => scenario,
        Err(_) => return,
    };

    let config = CrashConfig {
        resolve_symbols: scenario != "raw",
        colorize: false,
        ..Default::default()
    };
    let () = crash::install(&config).unwrap();

    match scenario.as_str() {
        "abort" => process::abort(),
        _ => {
            let value = helper();
            println!("survived with {value}");
        }
    }
}

/// Check that a crash is reported and the process terminated by the
/// signal.
#[cfg(unix)]
#[test]
fn crash_report() {
    use std::os::unix::process::ExitStatusExt as _;

    let output = run_child("resolve");
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("survived"), "{stdout}");

    let signal = output.status.signal();
    assert!(
        matches!(signal, Some(libc::SIGSEGV) | Some(libc::SIGBUS)),
        "{:?}: {stderr}",
        output.status
    );
    assert!(stderr.contains("\n#0 "), "{stderr}");
    assert!(stderr.contains("Received signal SIG"), "{stderr}");

    if cfg!(any(target_os = "linux", target_vendor = "apple")) {
        // The faulting instruction may be part of a helper called by
        // `faulting_function`.
        let found = stderr
            .lines()
            .filter(|line| line.starts_with('#'))
            .take(3)
            .any(|line| line.contains("faulting_function"));
        assert!(found, "{stderr}");
    }
}

/// Check that crashes are reported without symbol resolution, if
/// requested.
#[cfg(unix)]
#[test]
fn crash_report_unresolved() {
    use std::os::unix::process::ExitStatusExt as _;

    let output = run_child("raw");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.signal().is_some(), "{stderr}");
    assert!(stderr.contains("unresolved"), "{stderr}");
    assert!(stderr.contains("\n#0 "), "{stderr}");
    assert!(stderr.contains(" in ? at ??:0"), "{stderr}");
}

/// Check that an abort is reported and the process still terminates via
/// `SIGABRT`.
#[cfg(unix)]
#[test]
fn crash_report_abort() {
    use std::os::unix::process::ExitStatusExt as _;

    let output = run_child("abort");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{stderr}");
    assert!(stderr.contains("Received signal SIGABRT"), "{stderr}");
}

/// Check that the top-level functions manage the handler's life cycle.
#[test]
fn crash_handler_lifecycle() {
    if env::var_os(CHILD_VAR).is_some() {
        return
    }

    let () = install_crash_handler().unwrap();
    defer!({
        let _result = uninstall_crash_handler();
    });
    assert_eq!(crash::state(), crash::State::Installed);
    let () = uninstall_crash_handler().unwrap();
    assert_eq!(crash::state(), crash::State::Uninstalled);
    let () = uninstall_crash_handler().unwrap();
}
