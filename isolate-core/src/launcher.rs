//! Launcher (C6): privilege precondition check, payload process spawn,
//! and on-exit reaping.
//!
//! §9 is explicit that a single-process design needs "an on-exit reaper"
//! to guarantee teardown, and that the alternative — "the original
//! two-process split ... a parent supervises and rolls back, a child
//! attaches and execs" — is equally acceptable. This module implements
//! that split with `std::process::Command`'s `pre_exec` hook rather than
//! a raw `fork`/`execve` pair, mirroring the teacher's own
//! `Jailer::add_pre_exec_hook` (`jailer/mod.rs`): the hook runs after
//! `fork()` but before `exec()` in the child, so attach (§4.5 step 10)
//! and credential drop (§4.5 step 11) happen in the process that is
//! about to become the payload, while this process — the supervising
//! parent — keeps its original privilege and mount namespace and can
//! `wait()` for the child and tear the sandbox down once it exits.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};

use crate::error::{HostError, OrchestratorError};
use crate::host::HostPrimitives;
use crate::orchestrator::IsolationContext;

/// Checked before orchestration begins. The concrete check is "effective
/// uid is 0": every C3 primitive (principal creation, mounts, namespace
/// entry, credential switch) needs root on Linux, and there is no
/// narrower capability-based check worth introducing for a single-binary
/// launcher with no persistent privilege boundary to shrink against.
pub fn check_privilege() -> Result<(), OrchestratorError> {
    if is_privileged() {
        Ok(())
    } else {
        Err(OrchestratorError::Unprivileged(
            "isolate must run with root privilege to provision namespaces, mounts, and principals".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(target_os = "linux"))]
fn is_privileged() -> bool {
    false
}

/// Builds the payload `Command`, but does not spawn it.
///
/// `argv[0]` is rewritten to the in-sandbox basename via
/// [`CommandExt::arg0`] rather than by hand-assembling a `CString`
/// vector; the starting environment is replaced wholesale with
/// `ctx.env` (already resolved by the orchestrator per §4.5 step 12).
///
/// The `pre_exec` closure runs §4.5 steps 10–11 — `container_attach`
/// then `credential_switch` — in the forked child, after `fork()` but
/// strictly before `exec()`. A failure in either is reported back to the
/// parent as the child's own `io::Error`/exit status; per §4.5, this is
/// the "point of no return for privilege" and is not rollback-able by
/// the journal, so it surfaces as [`OrchestratorError::LaunchFailed`].
#[cfg(target_os = "linux")]
pub fn build_payload_command(
    host: &'static dyn HostPrimitives,
    ctx: &IsolationContext,
    argv: &[String],
) -> Command {
    let basename = Path::new(&argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv[0].clone());
    let in_sandbox_path = format!("/{basename}");

    let mut cmd = Command::new(&in_sandbox_path);
    cmd.arg0(&basename);
    cmd.args(&argv[1..]);
    cmd.env_clear();
    cmd.envs(ctx.env.iter());

    let container_id = ctx.container_id.clone();
    let (uid, gid) = (ctx.uid, ctx.gid);

    // SAFETY: the closure only calls into `HostPrimitives`, which on
    // Linux is direct `nix`/`libc` syscalls (no allocator-sensitive
    // standard-library state beyond what those crates already document
    // as fork-safe for this narrow use), matching the same contract the
    // teacher's own `pre_exec` hook relies on for FD cleanup and rlimits.
    unsafe {
        cmd.pre_exec(move || {
            host.container_attach(&container_id).map_err(host_error_to_io)?;
            host.credential_switch(uid, gid).map_err(host_error_to_io)?;
            Ok(())
        });
    }

    cmd
}

#[cfg(not(target_os = "linux"))]
pub fn build_payload_command(
    _host: &'static dyn HostPrimitives,
    _ctx: &IsolationContext,
    argv: &[String],
) -> Command {
    Command::new(&argv[0])
}

fn host_error_to_io(err: HostError) -> io::Error {
    io::Error::other(err.to_string())
}

/// Spawns `cmd` and blocks until it exits, reaping it so it never
/// becomes a zombie — the on-exit reaper §9 requires. Returns the
/// spawned [`Child`] handle's final exit status to the caller so it can
/// both compute the process's own exit code and run the journal's
/// teardown only after the payload has actually finished.
///
/// Spawn failure (missing interpreter inside the sandbox, `pre_exec`
/// hook failure) and wait failure both surface as
/// [`OrchestratorError::LaunchFailed`], matching §4.5's rule that
/// anything past credential drop is the launcher's concern, not the
/// journal's.
pub fn spawn_and_reap(mut cmd: Command) -> Result<ExitStatus, OrchestratorError> {
    let mut child = cmd.spawn().map_err(OrchestratorError::LaunchFailed)?;
    wait_for_exit(&mut child)
}

/// Like [`spawn_and_reap`] but hands the spawned child's pid to `on_spawn`
/// before blocking on `wait()` — used to arm the exit guard (C7) with the
/// pid it needs to forward a signal received while this process is
/// blocked waiting for the payload.
pub fn spawn_and_reap_with<F: FnOnce(u32)>(
    mut cmd: Command,
    on_spawn: F,
) -> Result<ExitStatus, OrchestratorError> {
    let mut child = cmd.spawn().map_err(OrchestratorError::LaunchFailed)?;
    on_spawn(child.id());
    wait_for_exit(&mut child)
}

fn wait_for_exit(child: &mut Child) -> Result<ExitStatus, OrchestratorError> {
    child.wait().map_err(OrchestratorError::LaunchFailed)
}

/// Maps a payload's [`ExitStatus`] to the process exit code `isolate`
/// itself reports (§6: "payload exit code is returned when available").
/// A payload killed by a signal is reported the way a POSIX shell
/// reports it: `128 + signal number`.
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}
