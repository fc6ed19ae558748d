//! Isolation orchestrator (C5): drives the transactional provisioning
//! pipeline of §4.5 against a [`Policy`], recording every acquired
//! resource in a [`Journal`] so any failure can be unwound precisely.
//!
//! Staged, ordered pipeline: later steps depend on earlier side effects,
//! and rollback correctness depends on the journal's reverse-of-record
//! order matching the acquire order below exactly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{HostError, OrchestratorError};
use crate::host::{ContainerSpec, HostPrimitives, Metric, MountMode, NetworkMode};
use crate::journal::{EntryKind, Journal};
use crate::policy::{FileRule, Policy, Principal};
use crate::tag;

/// Where ephemeral root directories are created. A well-known temporary
/// parent; `root_path` below is always `{EPHEMERAL_ROOT_PARENT}/{tag}`.
pub const EPHEMERAL_ROOT_PARENT: &str = "/var/tmp/isolate";

/// `Idle → Provisioning → Attached → Dropped → HandedOff`, with a
/// terminal `RolledBack` reachable from `Provisioning` or `Attached`.
///
/// `Attached` and `Dropped` are entered by the forked child the launcher
/// (C6) creates, not by this `Orchestrator` value itself — once fork
/// happens, attach and credential drop run in the child's own address
/// space and can't be observed here. This parent-side state machine goes
/// straight from `Provisioning` to `HandedOff`; the variants are kept so
/// the full state machine named by §4.5 stays representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Provisioning,
    Attached,
    Dropped,
    HandedOff,
    RolledBack,
}

/// Ephemeral per-invocation aggregate produced by a successful
/// [`Orchestrator::provision`] and consumed by the launcher (C6).
///
/// Deliberately does not hold the [`Journal`]: `provision` returns it
/// alongside the context so the caller can hand the journal to the exit
/// guard (C7) as an independent `'static` value while still borrowing
/// the context itself for the launcher call.
pub struct IsolationContext {
    pub tag: String,
    pub uid: u32,
    pub gid: u32,
    pub container_id: String,
    pub root_path: PathBuf,
    pub env: HashMap<String, String>,
}

/// Drives §4.5 against a borrowed [`HostPrimitives`] implementation.
pub struct Orchestrator<'h> {
    host: &'h dyn HostPrimitives,
    state: State,
}

impl<'h> Orchestrator<'h> {
    pub fn new(host: &'h dyn HostPrimitives) -> Self {
        Orchestrator {
            host,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs steps 1–9 and 12–13 of §4.5 (everything that must happen in
    /// this, the supervising process). Steps 10–11 (attach, credential
    /// drop) are deferred to the launcher's forked child — see the
    /// comment in [`Orchestrator::provision_inner`] at that point in the
    /// pipeline. On success the caller holds an [`IsolationContext`]
    /// ready for the launcher plus the [`Journal`] that must be handed to
    /// the exit guard (C7); on failure the journal recorded so far has
    /// already been rolled back and `self` is left in `RolledBack`.
    pub fn provision(
        &mut self,
        policy: &Policy,
        payload_path: &Path,
    ) -> Result<(IsolationContext, Journal), OrchestratorError> {
        self.state = State::Provisioning;
        let journal = Journal::new();

        match self.provision_inner(policy, payload_path, &journal) {
            Ok(partial) => Ok((partial.into_context(), journal)),
            Err(err) => {
                journal.rollback(self.host);
                self.state = State::RolledBack;
                Err(err)
            }
        }
    }

    fn provision_inner(
        &mut self,
        policy: &Policy,
        payload_path: &Path,
        journal: &Journal,
    ) -> Result<PartialContext, OrchestratorError> {
        // 1. name synthesis
        let invocation_tag = tag::generate();
        info!(tag = %invocation_tag, "provisioning started");

        // 2. principal resolution
        let (uid, gid) = match &policy.principal {
            Principal::EphemeralAuto => {
                let (uid, gid) = self
                    .host
                    .principal_create_ephemeral(&invocation_tag)
                    .map_err(OrchestratorError::PrimitiveFailed)?;
                journal.record(EntryKind::PrincipalCreated(invocation_tag.clone()));
                (uid, gid)
            }
            Principal::Named(name) => {
                let resolved = self
                    .host
                    .principal_lookup(name)
                    .map_err(OrchestratorError::PrimitiveFailed)?;
                resolved.ok_or_else(|| {
                    OrchestratorError::PolicyViolation(format!("named principal '{name}' not found"))
                })?
            }
        };

        // 3. root filesystem
        let root_path = PathBuf::from(EPHEMERAL_ROOT_PARENT).join(&invocation_tag);
        self.host
            .root_dir_create(&root_path)
            .map_err(OrchestratorError::PrimitiveFailed)?;
        journal.record(EntryKind::RootDirCreated(root_path.display().to_string()));

        create_root_skeleton(self.host, &root_path)?;
        install_payload(self.host, &root_path, payload_path)?;
        let principal_name = match &policy.principal {
            Principal::EphemeralAuto => invocation_tag.clone(),
            Principal::Named(name) => name.clone(),
        };
        write_passwd_stub(self.host, &root_path, &principal_name, uid, gid)?;

        // 4. workspace
        if let Some(workspace_path) = &policy.workspace_path {
            let target = root_path.join("workspace");
            self.host
                .bind_mount(Path::new(workspace_path), &target, MountMode::ReadWrite)
                .map_err(OrchestratorError::PrimitiveFailed)?;
            journal.record(EntryKind::WorkspaceMounted(target.display().to_string()));
        }

        // 5. device filesystem — downgraded to warning on failure
        let dev_target = root_path.join("dev");
        match self.host.overlay_mount_dev(&dev_target) {
            Ok(()) => journal.record(EntryKind::DevMounted(dev_target.display().to_string())),
            Err(e) => warn!(error = %e, "device filesystem mount failed, continuing without it"),
        }

        // 6. filesystem capability materialization
        materialize_file_rules(self.host, &root_path, &policy.file_rules, journal);

        // 7. container creation
        let spec = ContainerSpec {
            name: invocation_tag.clone(),
            root: root_path.clone(),
            network_mode: NetworkMode::InheritHost,
            ipc_allowed: false,
            raw_sockets_allowed: false,
            af_sockets_allowed: true,
        };
        let container_id = self
            .host
            .container_create(&spec)
            .map_err(OrchestratorError::PrimitiveFailed)?;
        journal.record(EntryKind::ContainerCreated(container_id.clone()));

        // 8. resource accounting — each rule downgrades individually
        for (metric_name, value) in policy.limits.active() {
            let metric = match metric_name {
                "memory" => Metric::Memory,
                "processes" => Metric::Processes,
                "open_files" => Metric::OpenFiles,
                "cpu_percent" => Metric::CpuPercent,
                _ => unreachable!("Limits::active only yields known metric names"),
            };
            match self.host.accounting_add_rule(&invocation_tag, metric, value) {
                Ok(()) => journal.record(EntryKind::AccountingRuleAdded(invocation_tag.clone(), metric.as_str())),
                Err(e) => warn!(metric = metric.as_str(), error = %e, "accounting rule rejected, continuing"),
            }
        }

        // 9. network policy — retained as documentation only (§9)
        if !policy.network_rules.is_empty() {
            info!(
                count = policy.network_rules.len(),
                "network rules recorded but not enforced by the current host primitive"
            );
        }

        // 10. attach and 11. credential drop are NOT performed here. Both
        // mutate the calling process's own namespaces/credentials, and the
        // only process that may safely do that is the one about to exec
        // the payload — the launcher (C6) forks a child for exactly that
        // purpose and performs both from that child's `pre_exec` hook, so
        // this (the supervising parent) keeps its original privilege and
        // mount namespace and can tear the sandbox down once the payload
        // exits (§9: "the original two-process split ... a parent
        // supervises and rolls back, a child attaches and execs").

        // 12. environment preparation — pure data, safe to compute here;
        // the launcher passes it to the child's exec call unchanged.
        let env = build_environment(policy, &principal_name);

        // 13. install exit guard is the caller's responsibility (C7 wraps
        // the whole invocation); the orchestrator only hands back the
        // journal it must be told to roll back on signal/exit.
        self.state = State::HandedOff;

        Ok(PartialContext {
            tag: invocation_tag,
            uid,
            gid,
            container_id,
            root_path,
            env,
        })
    }
}

/// Everything [`IsolationContext`] needs except the journal itself, which
/// `provision` attaches once it decides to hand off rather than roll
/// back (the journal instance is owned by `provision`'s stack frame, not
/// by `provision_inner`, so rollback-on-error can use it by reference).
struct PartialContext {
    tag: String,
    uid: u32,
    gid: u32,
    container_id: String,
    root_path: PathBuf,
    env: HashMap<String, String>,
}

impl PartialContext {
    fn into_context(self) -> IsolationContext {
        IsolationContext {
            tag: self.tag,
            uid: self.uid,
            gid: self.gid,
            container_id: self.container_id,
            root_path: self.root_path,
            env: self.env,
        }
    }
}

const ROOT_SKELETON: &[&str] = &[
    "bin",
    "lib",
    "usr/lib",
    "usr/local/lib",
    "libexec",
    "etc",
    "var/log",
    "var/tmp",
    "var/run",
];

fn create_root_skeleton(host: &dyn HostPrimitives, root_path: &Path) -> Result<(), OrchestratorError> {
    for rel in ROOT_SKELETON {
        host.root_dir_create(&root_path.join(rel))
            .map_err(OrchestratorError::PrimitiveFailed)?;
    }
    // /tmp needs sticky 1777, distinct from the plain-0755 skeleton above.
    let tmp_path = root_path.join("tmp");
    host.root_dir_create(&tmp_path)
        .map_err(OrchestratorError::PrimitiveFailed)?;
    host.file_write(&tmp_path.join(".keep"), b"", 0o1777)
        .map_err(OrchestratorError::PrimitiveFailed)?;
    Ok(())
}

fn install_payload(
    host: &dyn HostPrimitives,
    root_path: &Path,
    payload_path: &Path,
) -> Result<(), OrchestratorError> {
    let basename = payload_path
        .file_name()
        .ok_or_else(|| OrchestratorError::PolicyViolation("payload path has no file name".into()))?;
    let bytes = std::fs::read(payload_path).map_err(|e| {
        OrchestratorError::PrimitiveFailed(HostError::failed("install_payload", e))
    })?;
    host.file_write(&root_path.join(basename), &bytes, 0o755)
        .map_err(OrchestratorError::PrimitiveFailed)?;
    Ok(())
}

fn write_passwd_stub(
    host: &dyn HostPrimitives,
    root_path: &Path,
    principal_name: &str,
    uid: u32,
    gid: u32,
) -> Result<(), OrchestratorError> {
    let passwd = format!(
        "root:x:0:0:root:/root:/bin/false\n{principal_name}:x:{uid}:{gid}:isolate principal:/tmp:/bin/false\n"
    );
    let group = format!("root:x:0:\n{principal_name}:x:{gid}:\n");
    host.file_write(&root_path.join("etc/passwd"), passwd.as_bytes(), 0o644)
        .map_err(OrchestratorError::PrimitiveFailed)?;
    host.file_write(&root_path.join("etc/group"), group.as_bytes(), 0o644)
        .map_err(OrchestratorError::PrimitiveFailed)?;
    Ok(())
}

fn materialize_file_rules(
    host: &dyn HostPrimitives,
    root_path: &Path,
    file_rules: &[FileRule],
    journal: &Journal,
) {
    for rule in file_rules {
        if !rule.perms.read {
            warn!(path = %rule.path, "file rule without read permission, skipping");
            continue;
        }
        let host_path = Path::new(&rule.path);
        if !host_path.is_dir() {
            warn!(path = %rule.path, "file rule path missing or not a directory, skipping");
            continue;
        }
        let mount_mode = if rule.perms.write {
            MountMode::ReadWrite
        } else {
            MountMode::ReadOnly
        };
        let relative = rule.path.trim_start_matches('/');
        let target = root_path.join(relative);
        match host.bind_mount(host_path, &target, mount_mode) {
            Ok(()) => journal.record(EntryKind::BindMounted(target.display().to_string())),
            Err(e) => warn!(path = %rule.path, error = %e, "bind mount failed, skipping"),
        }
    }
}

fn build_environment(policy: &Policy, principal_name: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if !policy.env_clear {
        for (key, value) in std::env::vars() {
            env.insert(key, value);
        }
    }
    for (key, value) in &policy.env_rules {
        env.insert(key.clone(), value.clone());
    }
    env.entry("USER".to_string()).or_insert_with(|| principal_name.to_string());
    env.entry("HOME".to_string()).or_insert_with(|| "/tmp".to_string());
    env.entry("LIBRARY_SEARCH_PATH".to_string())
        .or_insert_with(|| "/lib:/usr/lib:/usr/local/lib".to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::null::NullHost;
    use crate::policy::Limits;

    fn default_payload() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        (dir, path)
    }

    #[test]
    fn test_provision_ephemeral_auto_creates_principal() {
        let host = NullHost::new();
        let (_dir, payload) = default_payload();
        let mut orchestrator = Orchestrator::new(&host);
        let policy = Policy::default();

        let (ctx, _journal) = orchestrator.provision(&policy, &payload).unwrap();

        assert!(host.principal_exists(&ctx.tag));
        assert!(host.container_exists(&ctx.container_id));
        assert_eq!(orchestrator.state(), State::HandedOff);
    }

    #[test]
    fn test_provision_named_principal_missing_is_policy_violation() {
        let host = NullHost::new();
        let (_dir, payload) = default_payload();
        let mut orchestrator = Orchestrator::new(&host);
        let policy = Policy {
            principal: Principal::Named("nosuchuser".into()),
            ..Policy::default()
        };

        let err = orchestrator.provision(&policy, &payload).unwrap_err();

        assert_eq!(err.kind(), "PolicyViolation");
        assert_eq!(orchestrator.state(), State::RolledBack);
    }

    #[test]
    fn test_failed_provisioning_leaves_no_residue() {
        let host = NullHost::new();
        let (_dir, payload) = default_payload();
        let mut orchestrator = Orchestrator::new(&host);
        let policy = Policy {
            principal: Principal::Named("ghost".into()),
            ..Policy::default()
        };

        orchestrator.provision(&policy, &payload).unwrap_err();

        // step 3 (root dir) runs after step 2 (principal resolution):
        // a step-2 failure must leave no root directory behind.
        assert!(!host.any_dir_under(Path::new(EPHEMERAL_ROOT_PARENT)));
    }

    #[test]
    fn test_accounting_rule_failure_is_downgraded_not_fatal() {
        let host = NullHost::new();
        let (_dir, payload) = default_payload();
        let mut orchestrator = Orchestrator::new(&host);
        let policy = Policy {
            limits: Limits {
                memory_bytes: 64 * 1024 * 1024,
                ..Limits::default()
            },
            ..Policy::default()
        };

        let (ctx, _journal) = orchestrator.provision(&policy, &payload).unwrap();
        assert_eq!(host.accounting_rule_count(), 1);
        assert_eq!(ctx.uid, ctx.gid);
    }

    #[test]
    fn test_env_clear_yields_only_rules_and_defaults() {
        let host = NullHost::new();
        let (_dir, payload) = default_payload();
        let mut orchestrator = Orchestrator::new(&host);
        let policy = Policy {
            env_clear: true,
            env_rules: vec![("FOO".to_string(), "bar".to_string())],
            ..Policy::default()
        };

        let (ctx, _journal) = orchestrator.provision(&policy, &payload).unwrap();

        assert_eq!(ctx.env.get("FOO").map(String::as_str), Some("bar"));
        assert!(ctx.env.contains_key("USER"));
        assert!(ctx.env.contains_key("HOME"));
        assert_eq!(ctx.env.len(), 1 + 3);
    }
}
