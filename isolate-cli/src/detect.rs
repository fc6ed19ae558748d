//! Heuristic capability detection: inspects a binary and writes a draft
//! capability document in §4.1's grammar. A write-only producer of that
//! format — it never reads a document back, and `isolate_core` never
//! imports this module.
//!
//! The heuristics are deliberately shallow (a handful of byte-pattern
//! scans over the binary and its dynamic section), in the same spirit as
//! a pattern-matching risk scanner: good enough to draft a starting
//! point for a human to edit, not a guarantee of completeness.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Strings that, if present in the binary's bytes, suggest the payload
/// talks to the network. Matched as raw substrings against the whole
/// file — cheap and approximate, same tradeoff a static `strings | grep`
/// pipeline would make.
const NETWORK_HINTS: &[&str] = &["socket", "connect", "getaddrinfo", "libssl", "libcrypto"];

/// Dynamic-library path prefixes commonly needed by ELF binaries;
/// included unconditionally as read+execute file rules whenever the
/// binary is dynamically linked, since a missing `ld.so` search path is
/// the single most common reason a detected draft fails on first run.
const COMMON_LIB_DIRS: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64"];

pub fn write_draft(binary_path: &Path, output_path: &Path) -> Result<()> {
    let bytes = fs::read(binary_path)
        .with_context(|| format!("reading {}", binary_path.display()))?;

    let is_elf = bytes.starts_with(ELF_MAGIC);
    let wants_network = NETWORK_HINTS
        .iter()
        .any(|hint| contains_subslice(&bytes, hint.as_bytes()));

    let document = render(is_elf, wants_network);

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("creating {}", output_path.display()))?;
    file.write_all(document.as_bytes())
        .with_context(|| format!("writing {}", output_path.display()))?;

    Ok(())
}

fn render(is_elf: bool, wants_network: bool) -> String {
    let mut doc = String::new();
    doc.push_str("# draft capability document, generated by isolate -d\n");
    doc.push_str("# review every line before trusting it in production\n");
    doc.push_str("user: auto\n");
    doc.push_str("memory: 256M\n");
    doc.push_str("processes: 16\n");
    doc.push_str("files: 64\n");

    if is_elf {
        for dir in COMMON_LIB_DIRS {
            doc.push_str(&format!("filesystem: {dir}:rx\n"));
        }
    }

    if wants_network {
        doc.push_str("network: tcp:0.0.0.0:out\n");
    } else {
        doc.push_str("network: none\n");
    }

    doc
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_non_elf_denies_network_and_libs() {
        let doc = render(false, false);
        assert!(doc.contains("network: none"));
        assert!(!doc.contains("filesystem: /lib"));
    }

    #[test]
    fn test_render_elf_with_network_hint() {
        let doc = render(true, true);
        assert!(doc.contains("filesystem: /usr/lib:rx"));
        assert!(doc.contains("network: tcp:0.0.0.0:out"));
    }

    #[test]
    fn test_contains_subslice() {
        assert!(contains_subslice(b"hello socket world", b"socket"));
        assert!(!contains_subslice(b"hello world", b"socket"));
    }

    #[test]
    fn test_write_draft_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let binary_path = dir.path().join("payload");
        fs::write(&binary_path, b"\x7fELF\x02\x01\x01\x00socket stuff").unwrap();
        let output_path = dir.path().join("payload.caps");

        write_draft(&binary_path, &output_path).unwrap();

        let written = fs::read_to_string(&output_path).unwrap();
        let policy = isolate_core::policy::parse(&written);
        assert_eq!(policy.principal, isolate_core::policy::Principal::EphemeralAuto);
        assert_eq!(policy.limits.memory_bytes, 256 * 1024 * 1024);
    }
}
