//! Transaction journal (C4): an ordered, append-only record of acquired
//! resources with per-entry release actions, rolled back in strict LIFO
//! order.
//!
//! Deliberately not `Drop`-based: §9 requires rollback to be callable
//! explicitly from both the orchestrator's own error path and from the
//! signal/exit guard (C7), and a double-invocation must be a safe no-op.
//! A `Drop` impl would race with that second, deliberate call.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::host::HostPrimitives;

/// One resource the orchestrator has acquired, in the order §4.4 lists.
#[derive(Debug, Clone)]
pub enum EntryKind {
    PrincipalCreated(String),
    RootDirCreated(String),
    WorkspaceMounted(String),
    BindMounted(String),
    DevMounted(String),
    ContainerCreated(String),
    AccountingRuleAdded(String, &'static str),
}

struct Entry {
    kind: EntryKind,
}

/// Ordered, single-owner log of acquired resources.
///
/// Mutation is guarded by a `Mutex` purely so the journal can be held
/// behind a process-local static for the signal handler (§9); the
/// orchestrator itself never accesses it from more than one thread.
pub struct Journal {
    entries: Mutex<Vec<Entry>>,
    rolled_back: Mutex<bool>,
}

impl Journal {
    pub fn new() -> Self {
        Journal {
            entries: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(false),
        }
    }

    /// Appends an entry. No deduplication: recording the same target
    /// twice is legal and rolls it back twice.
    pub fn record(&self, kind: EntryKind) {
        info!(?kind, "journal: recorded");
        self.entries.lock().unwrap().push(Entry { kind });
    }

    /// Discards all entries without releasing them. Legal only once
    /// responsibility for teardown has been handed to something else
    /// (§4.4) — the orchestrator never calls this before `container_attach`
    /// succeeds.
    pub fn commit(&self) {
        let mut entries = self.entries.lock().unwrap();
        info!(count = entries.len(), "journal: committed, entries discarded");
        entries.clear();
    }

    /// Invokes each entry's release action in strict reverse-of-record
    /// order. A release failure is logged and rollback continues — this
    /// may never abort partway through. Idempotent: a second call is a
    /// no-op.
    pub fn rollback(&self, host: &dyn HostPrimitives) {
        let mut rolled_back = self.rolled_back.lock().unwrap();
        if *rolled_back {
            return;
        }
        *rolled_back = true;

        let mut entries = self.entries.lock().unwrap();
        for entry in entries.drain(..).rev() {
            release_one(host, &entry.kind);
        }
    }

    /// Number of entries currently recorded (testable property: empty
    /// after rollback).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

fn release_one(host: &dyn HostPrimitives, kind: &EntryKind) {
    match kind {
        EntryKind::PrincipalCreated(name) => {
            host.principal_destroy(name);
        }
        EntryKind::RootDirCreated(path) => {
            host.dir_remove_recursive(std::path::Path::new(path));
        }
        EntryKind::WorkspaceMounted(target) | EntryKind::BindMounted(target) | EntryKind::DevMounted(target) => {
            host.unmount(std::path::Path::new(target));
        }
        EntryKind::ContainerCreated(id) => {
            host.container_destroy(id);
        }
        EntryKind::AccountingRuleAdded(container, metric) => {
            // accounting rules are torn down with the container itself
            // (cgroup leaf removal); nothing to release independently.
            let _ = (container, metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::null::NullHost;

    #[test]
    fn test_rollback_is_strict_lifo() {
        let host = NullHost::new();
        host.root_dir_create(std::path::Path::new("/tmp/isolate-j1")).unwrap();
        host.bind_mount(
            std::path::Path::new("/tmp"),
            std::path::Path::new("/tmp/isolate-j1/bound"),
            crate::host::MountMode::ReadOnly,
        )
        .unwrap();

        let journal = Journal::new();
        journal.record(EntryKind::RootDirCreated("/tmp/isolate-j1".into()));
        journal.record(EntryKind::BindMounted("/tmp/isolate-j1/bound".into()));

        journal.rollback(&host);

        assert!(journal.is_empty());
        assert!(!host.mount_exists(std::path::Path::new("/tmp/isolate-j1/bound")));
        assert!(!host.dir_exists(std::path::Path::new("/tmp/isolate-j1")));
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let host = NullHost::new();
        let journal = Journal::new();
        journal.record(EntryKind::RootDirCreated("/tmp/isolate-j2".into()));
        journal.rollback(&host);
        journal.rollback(&host);
        assert!(journal.is_empty());
    }

    #[test]
    fn test_commit_discards_without_releasing() {
        let host = NullHost::new();
        host.root_dir_create(std::path::Path::new("/tmp/isolate-j3")).unwrap();
        let journal = Journal::new();
        journal.record(EntryKind::RootDirCreated("/tmp/isolate-j3".into()));
        journal.commit();
        assert!(journal.is_empty());
        // committed, not rolled back: the resource is still live on the host.
        assert!(host.dir_exists(std::path::Path::new("/tmp/isolate-j3")));
    }
}
