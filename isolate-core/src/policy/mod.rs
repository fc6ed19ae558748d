//! In-memory capability-document schema (C2).
//!
//! Pure data: no parsing, no host interaction. [`parser`] turns text into
//! a [`Policy`]; the orchestrator turns a `Policy` into host primitive
//! calls.

pub mod parser;

pub use parser::{parse, parse_file};

/// Caps applied by the parser when a document names more entries than the
/// orchestrator is willing to carry.
pub const MAX_NETWORK_RULES: usize = 16;
pub const MAX_FILE_RULES: usize = 32;
pub const MAX_ENV_RULES: usize = 32;

/// Identity the payload runs under.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Principal {
    /// Create a fresh per-invocation principal.
    EphemeralAuto,
    /// Attach to an existing principal already known to the host.
    Named(String),
}

impl Default for Principal {
    fn default() -> Self {
        Principal::EphemeralAuto
    }
}

/// Subset of {read, write, execute} a [`FileRule`] grants.
///
/// A plain field struct rather than a bitflag type: the grammar in §4.1
/// only ever builds one of these from a handful of characters, and the
/// orchestrator only ever asks "is R/W/X set", so there is no set algebra
/// worth a dependency for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilePerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl FilePerms {
    pub const NONE: FilePerms = FilePerms {
        read: false,
        write: false,
        execute: false,
    };

    pub fn union(self, other: FilePerms) -> FilePerms {
        FilePerms {
            read: self.read || other.read,
            write: self.write || other.write,
            execute: self.execute || other.execute,
        }
    }
}

impl Default for FilePerms {
    fn default() -> Self {
        FilePerms {
            read: true,
            write: false,
            execute: false,
        }
    }
}

/// One host path exposed into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileRule {
    pub path: String,
    pub perms: FilePerms,
}

/// Transport a [`NetworkRule`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
    None,
}

/// A port, or the `ANY` sentinel (`unix` rules and bare `none` rules use it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Port {
    Any,
    Number(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Both,
    Out,
    In,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetworkRule {
    pub protocol: Protocol,
    pub address: String,
    pub port: Port,
    pub direction: Direction,
}

/// Non-zero resource caps; `0`/`None` means "unset" throughout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Limits {
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_files: u64,
    pub max_cpu_percent: u64,
}

impl Limits {
    /// Iterate the non-zero `(metric, value)` pairs, in the stable order
    /// the orchestrator installs accounting rules (§4.5 step 8).
    pub fn active(&self) -> Vec<(&'static str, u64)> {
        let mut out = Vec::with_capacity(4);
        if self.memory_bytes > 0 {
            out.push(("memory", self.memory_bytes));
        }
        if self.max_processes > 0 {
            out.push(("processes", self.max_processes));
        }
        if self.max_files > 0 {
            out.push(("open_files", self.max_files));
        }
        if self.max_cpu_percent > 0 {
            out.push(("cpu_percent", self.max_cpu_percent));
        }
        out
    }
}

/// The fully-resolved, immutable capability document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Policy {
    pub principal: Principal,
    pub workspace_path: Option<String>,
    pub file_rules: Vec<FileRule>,
    pub network_rules: Vec<NetworkRule>,
    pub env_rules: Vec<(String, String)>,
    pub env_clear: bool,
    pub network_default_deny: bool,
    pub fs_default_deny: bool,
    pub limits: Limits,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            principal: Principal::EphemeralAuto,
            workspace_path: None,
            file_rules: Vec::new(),
            network_rules: Vec::new(),
            env_rules: Vec::new(),
            env_clear: false,
            network_default_deny: false,
            fs_default_deny: false,
            limits: Limits::default(),
        }
    }
}
