//! An in-memory [`HostPrimitives`] implementation used by orchestrator
//! tests and by any platform without a real backend. Mirrors state in a
//! `Mutex`-guarded bookkeeping struct rather than touching the kernel,
//! the way a hand-written mock would for a trait this narrow.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{ContainerSpec, HostPrimitives, Metric, MountMode};
use crate::error::HostError;

#[derive(Debug, Default)]
struct State {
    principals: HashSet<String>,
    dirs: HashSet<PathBuf>,
    mounts: HashSet<PathBuf>,
    containers: HashSet<String>,
    attached: Option<String>,
    credential: Option<(u32, u32)>,
    accounting_rules: Vec<(String, &'static str, u64)>,
    next_uid: u32,
}

/// Deterministic stand-in host: every operation succeeds and is recorded,
/// so tests can assert on what the orchestrator actually asked for.
pub struct NullHost {
    state: Mutex<State>,
}

impl Default for NullHost {
    fn default() -> Self {
        NullHost {
            state: Mutex::new(State {
                next_uid: 10_000,
                ..State::default()
            }),
        }
    }
}

impl NullHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: has a directory at `path` been created (and not later
    /// removed) by the orchestrator?
    pub fn dir_exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn mount_exists(&self, target: &Path) -> bool {
        self.state.lock().unwrap().mounts.contains(target)
    }

    pub fn any_dir_under(&self, parent: &Path) -> bool {
        self.state.lock().unwrap().dirs.iter().any(|d| d.starts_with(parent))
    }

    pub fn principal_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().principals.contains(name)
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().containers.contains(id)
    }

    pub fn accounting_rule_count(&self) -> usize {
        self.state.lock().unwrap().accounting_rules.len()
    }

    pub fn credential(&self) -> Option<(u32, u32)> {
        self.state.lock().unwrap().credential
    }
}

impl HostPrimitives for NullHost {
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>, HostError> {
        let state = self.state.lock().unwrap();
        if state.principals.contains(name) {
            Ok(Some((10_000, 10_000)))
        } else {
            Ok(None)
        }
    }

    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.principals.contains(name) {
            return Ok((10_000, 10_000));
        }
        state.principals.insert(name.to_string());
        let uid = state.next_uid;
        state.next_uid += 1;
        Ok((uid, uid))
    }

    fn principal_destroy(&self, name: &str) {
        self.state.lock().unwrap().principals.remove(name);
    }

    fn root_dir_create(&self, path: &Path) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn bind_mount(&self, _source: &Path, target: &Path, _mode: MountMode) -> Result<(), HostError> {
        self.state.lock().unwrap().mounts.insert(target.to_path_buf());
        Ok(())
    }

    fn overlay_mount_dev(&self, target: &Path) -> Result<(), HostError> {
        self.state.lock().unwrap().mounts.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) {
        self.state.lock().unwrap().mounts.remove(target);
    }

    fn dir_remove_recursive(&self, path: &Path) {
        self.state.lock().unwrap().dirs.remove(path);
    }

    fn container_create(&self, spec: &ContainerSpec) -> Result<String, HostError> {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(spec.name.clone());
        Ok(spec.name.clone())
    }

    fn container_attach(&self, container_id: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains(container_id) {
            return Err(HostError::rejected("container_attach", "unknown container id"));
        }
        state.attached = Some(container_id.to_string());
        Ok(())
    }

    fn container_destroy(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }

    fn accounting_add_rule(
        &self,
        container_name: &str,
        metric: Metric,
        limit: u64,
    ) -> Result<(), HostError> {
        self.state
            .lock()
            .unwrap()
            .accounting_rules
            .push((container_name.to_string(), metric.as_str(), limit));
        Ok(())
    }

    fn credential_switch(&self, uid: u32, gid: u32) -> Result<(), HostError> {
        self.state.lock().unwrap().credential = Some((uid, gid));
        Ok(())
    }

    fn file_write(&self, _path: &Path, _bytes: &[u8], _mode: u32) -> Result<(), HostError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_create_is_idempotent() {
        let host = NullHost::new();
        let first = host.principal_create_ephemeral("isolate-abc").unwrap();
        let second = host.principal_create_ephemeral("isolate-abc").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_container_attach_requires_existing_container() {
        let host = NullHost::new();
        assert!(host.container_attach("nope").is_err());
    }

    #[test]
    fn test_root_dir_create_then_remove() {
        let host = NullHost::new();
        let path = Path::new("/tmp/isolate-test-root");
        host.root_dir_create(path).unwrap();
        assert!(host.dir_exists(path));
        host.dir_remove_recursive(path);
        assert!(!host.dir_exists(path));
    }
}
