//! Host primitives (C3): the narrow, mockable boundary between the
//! orchestrator and the kernel.
//!
//! Every operation corresponds one-to-one to an entry in §4.3. The trait
//! is object-safe so the orchestrator can hold a `&dyn HostPrimitives`
//! and be exercised under a [`null::NullHost`] in tests without touching
//! the real kernel.

pub mod null;

#[cfg(target_os = "linux")]
pub mod linux;

use crate::error::HostError;

/// Read/write mode for [`HostPrimitives::bind_mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Network posture the confinement container is created with. The only
/// mode implemented today is `InheritHost` (§9: no per-container firewall
/// primitive yet); the enum exists so a future primitive has somewhere to
/// land without changing the trait signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    InheritHost,
}

/// Arguments to [`HostPrimitives::container_create`].
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub root: std::path::PathBuf,
    pub network_mode: NetworkMode,
    pub ipc_allowed: bool,
    pub raw_sockets_allowed: bool,
    pub af_sockets_allowed: bool,
}

/// Resource-accounting metrics understood by
/// [`HostPrimitives::accounting_add_rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Memory,
    Processes,
    OpenFiles,
    CpuPercent,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Memory => "memory",
            Metric::Processes => "processes",
            Metric::OpenFiles => "open_files",
            Metric::CpuPercent => "cpu_percent",
        }
    }
}

/// The narrow OS boundary the orchestrator (C5) drives. Exactly the
/// fourteen operations of §4.3, no more.
pub trait HostPrimitives: Send + Sync {
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>, HostError>;

    /// Idempotent: an existing principal named `name` is returned as-is.
    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32), HostError>;

    /// Best-effort: never surfaces an error to the caller.
    fn principal_destroy(&self, name: &str);

    /// Removes any previous directory at `path`, then creates it 0755.
    fn root_dir_create(&self, path: &std::path::Path) -> Result<(), HostError>;

    fn bind_mount(
        &self,
        source: &std::path::Path,
        target: &std::path::Path,
        mode: MountMode,
    ) -> Result<(), HostError>;

    /// Mounts a device-node filesystem providing at minimum
    /// stdin/stdout/stderr/null at `target`.
    fn overlay_mount_dev(&self, target: &std::path::Path) -> Result<(), HostError>;

    /// Best-effort.
    fn unmount(&self, target: &std::path::Path);

    /// Best-effort.
    fn dir_remove_recursive(&self, path: &std::path::Path);

    fn container_create(&self, spec: &ContainerSpec) -> Result<String, HostError>;

    /// The current process enters the container; subsequent calls see
    /// only the container view.
    fn container_attach(&self, container_id: &str) -> Result<(), HostError>;

    /// Best-effort.
    fn container_destroy(&self, container_id: &str);

    /// Failure is downgraded to a warning by the caller; the feature may
    /// be disabled on the host.
    fn accounting_add_rule(
        &self,
        container_name: &str,
        metric: Metric,
        limit: u64,
    ) -> Result<(), HostError>;

    /// Sets gid then uid; atomic from the caller's perspective.
    fn credential_switch(&self, uid: u32, gid: u32) -> Result<(), HostError>;

    fn file_write(
        &self,
        path: &std::path::Path,
        bytes: &[u8],
        mode: u32,
    ) -> Result<(), HostError>;
}
