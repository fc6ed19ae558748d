//! Linux implementation of [`HostPrimitives`].
//!
//! Grounded directly on host namespace/mount/chroot primitives rather
//! than shelling out to `mount(8)`/`useradd(8)`/`chroot(1)` — every
//! operation here is a direct `nix`/`libc` syscall so failures carry a
//! real `io::Error` instead of an exit code to parse.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::mount::{mount, umount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{setresgid, setresuid, Gid, Uid};
use tracing::{debug, warn};

use super::{ContainerSpec, HostPrimitives, Metric, MountMode};
use crate::error::HostError;

const PASSWD_PATH: &str = "/etc/passwd";
const GROUP_PATH: &str = "/etc/group";
const EPHEMERAL_UID_BASE: u32 = 61_000;
const EPHEMERAL_UID_MAX: u32 = 65_000;
const CGROUP_ROOT: &str = "/sys/fs/cgroup/isolate";

const DEV_NODES: &[&str] = &["null", "zero", "urandom", "random", "tty"];

fn io_err(primitive: &'static str, source: io::Error) -> HostError {
    HostError::failed(primitive, source)
}

fn nix_err(primitive: &'static str, source: nix::Error) -> HostError {
    HostError::failed(primitive, io::Error::from_raw_os_error(source as i32))
}

/// Real host primitives. Holds no mutable state of its own beyond an
/// advisory lock guarding `/etc/passwd`/`/etc/group` edits and a table
/// mapping container ids to the spec they were created with (mount
/// cleanup needs the root path at destroy time).
pub struct LinuxHost {
    passwd_lock: Mutex<()>,
    containers: Mutex<HashMap<String, ContainerSpec>>,
}

impl Default for LinuxHost {
    fn default() -> Self {
        LinuxHost {
            passwd_lock: Mutex::new(()),
            containers: Mutex::new(HashMap::new()),
        }
    }
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_free_uid(&self, passwd_text: &str) -> Option<u32> {
        let used: std::collections::HashSet<u32> = passwd_text
            .lines()
            .filter_map(|line| line.split(':').nth(2))
            .filter_map(|uid| uid.parse::<u32>().ok())
            .collect();
        (EPHEMERAL_UID_BASE..EPHEMERAL_UID_MAX).find(|uid| !used.contains(uid))
    }
}

impl HostPrimitives for LinuxHost {
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>, HostError> {
        let _guard = self.passwd_lock.lock().unwrap();
        let text = fs::read_to_string(PASSWD_PATH).map_err(|e| io_err("principal_lookup", e))?;
        for line in text.lines() {
            let mut fields = line.split(':');
            if fields.next() == Some(name) {
                let uid = fields.nth(1).and_then(|s| s.parse().ok());
                let gid = fields.next().and_then(|s| s.parse().ok());
                if let (Some(uid), Some(gid)) = (uid, gid) {
                    return Ok(Some((uid, gid)));
                }
            }
        }
        Ok(None)
    }

    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32), HostError> {
        let _guard = self.passwd_lock.lock().unwrap();
        let passwd_text =
            fs::read_to_string(PASSWD_PATH).map_err(|e| io_err("principal_create_ephemeral", e))?;

        for line in passwd_text.lines() {
            let mut fields = line.split(':');
            if fields.next() == Some(name) {
                let uid = fields.nth(1).and_then(|s| s.parse().ok());
                let gid = fields.next().and_then(|s| s.parse().ok());
                if let (Some(uid), Some(gid)) = (uid, gid) {
                    debug!(name, uid, gid, "ephemeral principal already exists, reusing");
                    return Ok((uid, gid));
                }
            }
        }

        let uid = self.find_free_uid(&passwd_text).ok_or_else(|| {
            HostError::rejected("principal_create_ephemeral", "no free uid in ephemeral range")
        })?;

        let mut passwd_file = fs::OpenOptions::new()
            .append(true)
            .open(PASSWD_PATH)
            .map_err(|e| io_err("principal_create_ephemeral", e))?;
        writeln!(passwd_file, "{name}:x:{uid}:{uid}:isolate ephemeral:/tmp:/bin/false")
            .map_err(|e| io_err("principal_create_ephemeral", e))?;

        let mut group_file = fs::OpenOptions::new()
            .append(true)
            .open(GROUP_PATH)
            .map_err(|e| io_err("principal_create_ephemeral", e))?;
        writeln!(group_file, "{name}:x:{uid}:").map_err(|e| io_err("principal_create_ephemeral", e))?;

        Ok((uid, uid))
    }

    fn principal_destroy(&self, name: &str) {
        let _guard = self.passwd_lock.lock().unwrap();
        for (path, expected_cols) in [(PASSWD_PATH, 7usize), (GROUP_PATH, 4usize)] {
            let Ok(text) = fs::read_to_string(path) else {
                continue;
            };
            let filtered: String = text
                .lines()
                .filter(|line| {
                    let cols = line.split(':').count();
                    !(cols == expected_cols && line.split(':').next() == Some(name))
                })
                .map(|l| format!("{l}\n"))
                .collect();
            if let Err(e) = fs::write(path, filtered) {
                warn!(path, error = %e, "failed to remove ephemeral principal entry");
            }
        }
    }

    fn root_dir_create(&self, path: &Path) -> Result<(), HostError> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(|e| io_err("root_dir_create", e))?;
        }
        fs::create_dir_all(path).map_err(|e| io_err("root_dir_create", e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| io_err("root_dir_create", e))?;
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path, mode: MountMode) -> Result<(), HostError> {
        if source.is_dir() {
            fs::create_dir_all(target).map_err(|e| io_err("bind_mount", e))?;
        } else if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("bind_mount", e))?;
            if !target.exists() {
                fs::File::create(target).map_err(|e| io_err("bind_mount", e))?;
            }
        }

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| nix_err("bind_mount", e))?;

        if mode == MountMode::ReadOnly {
            if let Err(e) = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            ) {
                warn!(target = %target.display(), error = %e, "read-only remount failed, mount stays read-write");
            }
        }

        Ok(())
    }

    fn overlay_mount_dev(&self, target: &Path) -> Result<(), HostError> {
        fs::create_dir_all(target).map_err(|e| io_err("overlay_mount_dev", e))?;
        mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=0755"),
        )
        .map_err(|e| nix_err("overlay_mount_dev", e))?;

        for node in DEV_NODES {
            let host_path = PathBuf::from("/dev").join(node);
            if !host_path.exists() {
                continue;
            }
            let target_path = target.join(node);
            fs::File::create(&target_path).map_err(|e| io_err("overlay_mount_dev", e))?;
            if let Err(e) = mount(
                Some(&host_path),
                &target_path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            ) {
                warn!(node, error = %e, "failed to bind device node into sandbox dev");
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) {
        if let Err(e) = umount(target) {
            debug!(target = %target.display(), error = %e, "unmount failed (best-effort)");
        }
    }

    fn dir_remove_recursive(&self, path: &Path) {
        if let Err(e) = fs::remove_dir_all(path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "dir removal failed (best-effort)");
            }
        }
    }

    fn container_create(&self, spec: &ContainerSpec) -> Result<String, HostError> {
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    fn container_attach(&self, container_id: &str) -> Result<(), HostError> {
        let spec = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| HostError::rejected("container_attach", "unknown container id"))?;

        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
        if !spec.ipc_allowed {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        unshare(flags).map_err(|e| nix_err("container_attach", e))?;

        // make the mount tree private before bind-mounting into it, so
        // none of this leaks back to the host mount namespace.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| nix_err("container_attach", e))?;

        nix::unistd::chroot(&spec.root).map_err(|e| nix_err("container_attach", e))?;
        nix::unistd::chdir("/").map_err(|e| nix_err("container_attach", e))?;

        Ok(())
    }

    fn container_destroy(&self, container_id: &str) {
        self.containers.lock().unwrap().remove(container_id);
        let cgroup_dir = PathBuf::from(CGROUP_ROOT).join(container_id);
        if cgroup_dir.exists() {
            if let Err(e) = fs::remove_dir(&cgroup_dir) {
                debug!(container_id, error = %e, "cgroup removal failed (best-effort)");
            }
        }
    }

    fn accounting_add_rule(
        &self,
        container_name: &str,
        metric: Metric,
        limit: u64,
    ) -> Result<(), HostError> {
        let cgroup_dir = PathBuf::from(CGROUP_ROOT).join(container_name);
        fs::create_dir_all(&cgroup_dir).map_err(|e| io_err("accounting_add_rule", e))?;

        let (file_name, value) = match metric {
            Metric::Memory => ("memory.max".to_string(), limit.to_string()),
            Metric::Processes => ("pids.max".to_string(), limit.to_string()),
            Metric::OpenFiles => {
                return Err(HostError::rejected(
                    "accounting_add_rule",
                    "open_files accounting is not a cgroup v2 controller on this host",
                ));
            }
            Metric::CpuPercent => {
                let period_us = 100_000u64;
                let quota_us = period_us.saturating_mul(limit) / 100;
                ("cpu.max".to_string(), format!("{quota_us} {period_us}"))
            }
        };

        let path = cgroup_dir.join(&file_name);
        fs::write(&path, value).map_err(|e| io_err("accounting_add_rule", e))?;
        Ok(())
    }

    fn credential_switch(&self, uid: u32, gid: u32) -> Result<(), HostError> {
        let original_gid = Gid::current();

        setresgid(Gid::from_raw(gid), Gid::from_raw(gid), Gid::from_raw(gid))
            .map_err(|e| nix_err("credential_switch", e))?;

        if let Err(e) = setresuid(Uid::from_raw(uid), Uid::from_raw(uid), Uid::from_raw(uid)) {
            // uid hasn't moved yet and CAP_SETGID is still held, so the
            // gid drop above can still be undone: restore it rather than
            // leave a split state (dropped gid, original uid).
            if let Err(restore_err) = setresgid(original_gid, original_gid, original_gid) {
                warn!(
                    error = %restore_err,
                    "failed to restore original gid after credential_switch aborted, privilege state may be split"
                );
            }
            return Err(nix_err("credential_switch", e));
        }

        Ok(())
    }

    fn file_write(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<(), HostError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("file_write", e))?;
        }
        fs::write(path, bytes).map_err(|e| io_err("file_write", e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| io_err("file_write", e))?;
        Ok(())
    }
}
