//! Signal/exit guard (C7): guarantees the journal's `rollback()` runs on
//! every exit path out of the pre-`exec` window.
//!
//! Uses `signal_hook`'s iterator-based forwarding rather than a raw
//! `sigaction` handler: the low-level handler it installs only writes to
//! a self-pipe (async-signal-safe), and the actual rollback runs on an
//! ordinary background thread woken by that pipe — so `rollback()` is
//! free to lock mutexes and call into the filesystem, which a true
//! signal handler could not safely do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use signal_hook::consts::{SIGABRT, SIGHUP, SIGINT, SIGSEGV, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, warn};

use crate::host::HostPrimitives;
use crate::journal::Journal;

/// Watches the signals named in §4.7 and rolls the journal back the
/// first time one arrives. Rollback is idempotent, so racing against an
/// explicit caller-driven rollback on the main path is harmless.
///
/// Once the launcher (C6) has spawned the payload, this process is no
/// longer the one under confinement — the forked child is — so a signal
/// arriving during that window is forwarded to the child and the guard
/// waits for it to die before rolling back. Rolling back while the
/// child is still running would race the journal's unmount/destroy
/// calls against a process still holding those resources open.
pub struct ExitGuard {
    settled: Arc<AtomicBool>,
    child_pid: Arc<Mutex<Option<i32>>>,
}

impl ExitGuard {
    /// Spawns the watcher thread. `host` and `journal` need `'static`
    /// lifetime because the watcher outlives this call on its own thread;
    /// in `main` both are created once for the process's one invocation
    /// and leaked (`Box::leak`) rather than dropped, which is the
    /// deliberate tradeoff of a daemonless, single-shot binary.
    pub fn install(host: &'static dyn HostPrimitives, journal: &'static Journal) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGSEGV, SIGABRT])?;
        let settled = Arc::new(AtomicBool::new(false));
        let settled_thread = settled.clone();
        let child_pid: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
        let child_pid_thread = child_pid.clone();

        std::thread::spawn(move || {
            for signal in signals.forever() {
                if settled_thread.swap(true, Ordering::SeqCst) {
                    continue;
                }
                match signal {
                    SIGTERM | SIGINT | SIGHUP => {
                        warn!(signal, "provisioning aborted by signal, rolling back");
                    }
                    SIGSEGV | SIGABRT => {
                        error!(signal, "orchestrator crashed, attempting best-effort rollback");
                    }
                    _ => {}
                }

                if let Some(pid) = *child_pid_thread.lock().unwrap() {
                    // Forward the signal to the running payload and wait
                    // for it to exit before tearing its own root dir and
                    // mounts down out from under it.
                    unsafe {
                        libc::kill(pid, signal);
                    }
                    let mut status = 0i32;
                    unsafe {
                        libc::waitpid(pid, &mut status, 0);
                    }
                }

                journal.rollback(host);
                if signal == SIGSEGV || signal == SIGABRT {
                    // best-effort only: re-raise so the default disposition
                    // (core dump, non-zero exit) still applies.
                    unsafe {
                        libc::signal(signal, libc::SIG_DFL);
                        libc::raise(signal);
                    }
                } else {
                    std::process::exit(1);
                }
            }
        });

        Ok(ExitGuard { settled, child_pid })
    }

    /// Records the pid of the spawned payload so a signal arriving while
    /// this process is blocked in `wait()` is forwarded to it rather than
    /// rolling the journal back underneath a still-running child.
    pub fn set_child_pid(&self, pid: u32) {
        *self.child_pid.lock().unwrap() = Some(pid as i32);
    }

    /// Marks the guard as no longer needed without touching the journal.
    pub fn disarm(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}
