//! Demo targets that each terminate one specific way.
//!
//! Every mode prints an announcement line to stderr before triggering
//! its condition, mirroring how real runtimes emit diagnostics just
//! before death. Used by the end-to-end tests and handy for manual
//! runs:
//!
//! ```text
//! crash-tracer run -- crash-fixture segv
//! ```

use std::io::Write as _;

fn announce(mode: &str, message: &str) {
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "[crash-fixture/{mode}] {message}");
    let _ = stderr.flush();
}

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        // Native fault: write through a null pointer. Kernel raises
        // SIGSEGV with SEGV_MAPERR.
        "segv" => {
            announce("segv", "writing through a null pointer...");
            unsafe {
                std::ptr::null_mut::<i32>().write_volatile(42);
            }
            announce("segv", "unreachable");
        }

        // Abort primitive: raises SIGABRT through the self-directed
        // delivery path.
        "abort" => {
            announce("abort", "calling abort()...");
            unsafe {
                libc::abort();
            }
        }

        // Self-delivered fault signal without an actual fault.
        "raise-segv" => {
            announce("raise-segv", "raising SIGSEGV at self...");
            unsafe {
                libc::raise(libc::SIGSEGV);
            }
            announce("raise-segv", "unreachable");
        }

        // Same, via kill(getpid()) instead of raise().
        "kill-self-segv" => {
            announce("kill-self-segv", "sending SIGSEGV to own pid...");
            unsafe {
                libc::kill(libc::getpid(), libc::SIGSEGV);
            }
            announce("kill-self-segv", "unreachable");
        }

        // Pre-installed handler: the fault is caught in-process, a
        // diagnostic goes to stderr, and the process exits on its own —
        // the underlying SIGSEGV is still delivered first.
        "handled-segv" => {
            announce("handled-segv", "installing SIGSEGV handler, then faulting...");
            unsafe {
                libc::signal(libc::SIGSEGV, on_segv as libc::sighandler_t);
                std::ptr::null_mut::<i32>().write_volatile(42);
            }
            announce("handled-segv", "unreachable");
        }

        // Deep recursion bounded inside the program: no signal, clean
        // exit.
        "clean-recursion" => {
            announce("clean-recursion", "recursing to an internal limit...");
            let depth = recurse(0, 10_000);
            announce("clean-recursion", &format!("bounded at depth {depth}, exiting 0"));
        }

        // Uncaught language-level failure: the runtime prints a trace
        // and exits non-zero; no signal is ever delivered.
        "uncaught-panic" => {
            announce("uncaught-panic", "panicking without a handler...");
            panic!("deliberate uncaught failure");
        }

        // Stay alive until killed from outside.
        "sleep" => {
            announce("sleep", "sleeping...");
            loop {
                std::thread::sleep(std::time::Duration::from_secs(30));
            }
        }

        other => {
            announce("usage", &format!("unknown mode {other:?}"));
            eprintln!(
                "usage: crash-fixture <segv|abort|raise-segv|kill-self-segv|handled-segv|clean-recursion|uncaught-panic|sleep>"
            );
            std::process::exit(2);
        }
    }
}

// Async-signal-safe: write(2) plus _exit(2) only.
extern "C" fn on_segv(_signal: libc::c_int) {
    const MSG: &[u8] = b"[crash-fixture/handled-segv] handler caught the fault, exiting 1\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
        libc::_exit(1);
    }
}

fn recurse(depth: usize, limit: usize) -> usize {
    if depth >= limit {
        return depth;
    }
    // Touch a stack local so the frames are real.
    let marker = [depth; 4];
    recurse(marker[0] + 1, limit)
}
