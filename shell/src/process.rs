//! Process-level plumbing shared by every place that forks.

use crate::command::ExitCode;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::{self, Write};

/// Flush Rust's buffered standard streams.
///
/// Must run before `fork`, otherwise buffered bytes get written twice.
pub fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Leave a forked child without running the parent's destructors or atexit hooks.
pub fn terminate(code: ExitCode) -> ! {
    flush_stdio();
    unsafe { libc::_exit(code) }
}

fn set_disposition(sig: Signal, handler: SigHandler) {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: only SIG_DFL / SIG_IGN are installed, no Rust handler runs.
    if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
        tracing::warn!("sigaction({sig}) failed: {e}");
    }
}

/// The interpreter itself must survive Ctrl-C and Ctrl-\ from the terminal.
pub fn ignore_interactive_signals() {
    set_disposition(Signal::SIGINT, SigHandler::SigIgn);
    set_disposition(Signal::SIGQUIT, SigHandler::SigIgn);
}

/// Called in every freshly forked child.
///
/// SIGPIPE goes back to default so upstream writers die when a reader quits.
/// Foreground children also get SIGINT/SIGQUIT back; background ones keep
/// ignoring the terminal.
pub fn reset_child_signals(foreground: bool) {
    set_disposition(Signal::SIGPIPE, SigHandler::SigDfl);
    if foreground {
        set_disposition(Signal::SIGINT, SigHandler::SigDfl);
        set_disposition(Signal::SIGQUIT, SigHandler::SigDfl);
    }
}
