//! Capability-document parser (C1): text in, [`Policy`] out.
//!
//! Per-line problems never abort parsing — unknown keys and malformed
//! values are logged as warnings and the offending line is skipped. Only
//! an unreadable `-c FILE` named explicitly by the caller is fatal; that
//! path lives in [`parse_file`], not here.

use std::fs;
use std::path::Path;

use tracing::warn;

use super::{
    Direction, FileRule, FilePerms, Limits, MAX_ENV_RULES, MAX_FILE_RULES, MAX_NETWORK_RULES,
    NetworkRule, Policy, Port, Principal, Protocol,
};
use crate::error::PolicyError;

/// Parse a document that was explicitly named by the caller (`-c FILE`).
/// An unreadable file is fatal here; a *missing default* file is handled
/// by the caller via [`parse`] with an empty string and a warning, per
/// the "document not found is recoverable" rule.
pub fn parse_file(path: &Path) -> Result<Policy, PolicyError> {
    let bytes = fs::read(path).map_err(|source| PolicyError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| PolicyError::NotUtf8 {
        path: path.display().to_string(),
    })?;
    Ok(parse(&text))
}

/// Parse capability-document text into a [`Policy`]. Always succeeds;
/// malformed lines are warned about and skipped (spec invariant: parsing
/// terminates and yields a `Policy` for any input).
pub fn parse(text: &str) -> Policy {
    let mut policy = Policy::default();
    let mut network_count = 0usize;
    let mut file_count = 0usize;
    let mut env_count = 0usize;

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            warn!(lineno, line, "capability line missing ':' separator, skipping");
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "user" => match value {
                "auto" => policy.principal = Principal::EphemeralAuto,
                "" => warn!(lineno, "empty 'user' value, skipping"),
                name => policy.principal = Principal::Named(name.to_string()),
            },
            "memory" => match parse_size(value) {
                Some(bytes) => policy.limits.memory_bytes = bytes,
                None => warn!(lineno, value, "malformed memory value, skipping"),
            },
            "processes" => match value.parse::<u64>() {
                Ok(n) => policy.limits.max_processes = n,
                Err(_) => warn!(lineno, value, "malformed processes value, skipping"),
            },
            "files" => match value.parse::<u64>() {
                Ok(n) => policy.limits.max_files = n,
                Err(_) => warn!(lineno, value, "malformed files value, skipping"),
            },
            "cpu" => match value.parse::<u64>() {
                Ok(n) => policy.limits.max_cpu_percent = n,
                Err(_) => warn!(lineno, value, "malformed cpu value, skipping"),
            },
            "network" => {
                if network_count >= MAX_NETWORK_RULES {
                    warn!(lineno, "network rule limit ({MAX_NETWORK_RULES}) exceeded, discarding");
                    continue;
                }
                match parse_network_rule(value) {
                    Some(rule) => {
                        policy.network_rules.push(rule);
                        network_count += 1;
                    }
                    None => warn!(lineno, value, "malformed network rule, skipping"),
                }
            }
            "filesystem" | "file" => {
                if file_count >= MAX_FILE_RULES {
                    warn!(lineno, "file rule limit ({MAX_FILE_RULES}) exceeded, discarding");
                    continue;
                }
                match parse_file_rule(value) {
                    Some(rule) => {
                        policy.file_rules.push(rule);
                        file_count += 1;
                    }
                    None => warn!(lineno, value, "malformed file rule, skipping"),
                }
            }
            "env" => {
                if env_count >= MAX_ENV_RULES {
                    warn!(lineno, "env rule limit ({MAX_ENV_RULES}) exceeded, discarding");
                    continue;
                }
                match value.split_once('=') {
                    Some((name, val)) if !name.is_empty() => {
                        policy.env_rules.push((name.to_string(), val.to_string()));
                        env_count += 1;
                    }
                    _ => warn!(lineno, value, "malformed env rule, skipping"),
                }
            }
            "network_default" => match parse_deny(value) {
                Some(deny) => policy.network_default_deny = deny,
                None => warn!(lineno, value, "expected 'deny' or 'allow', skipping"),
            },
            "filesystem_default" => match parse_deny(value) {
                Some(deny) => policy.fs_default_deny = deny,
                None => warn!(lineno, value, "expected 'deny' or 'allow', skipping"),
            },
            "env_clear" => match parse_bool(value) {
                Some(b) => policy.env_clear = b,
                None => warn!(lineno, value, "expected a boolean, skipping"),
            },
            "workspace" => {
                if value.starts_with('/') {
                    policy.workspace_path = Some(value.to_string());
                } else {
                    warn!(lineno, value, "workspace path must be absolute, skipping");
                }
            }
            other => warn!(lineno, key = other, "unknown capability key, skipping"),
        }
    }

    policy
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_deny(value: &str) -> Option<bool> {
    match value {
        "deny" => Some(true),
        "allow" => Some(false),
        _ => None,
    }
}

/// `number` with an optional case-insensitive `B/K/M/G` suffix, default `B`.
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let last = value.chars().last().unwrap();
    let (digits, multiplier) = if last.is_ascii_digit() {
        (value, 1u64)
    } else {
        let multiplier = match last.to_ascii_lowercase() {
            'b' => 1u64,
            'k' => 1024u64,
            'm' => 1024u64 * 1024,
            'g' => 1024u64 * 1024 * 1024,
            _ => return None,
        };
        (&value[..value.len() - 1], multiplier)
    };
    let digits = digits.trim();
    digits
        .parse::<u64>()
        .ok()
        .map(|n| n.saturating_mul(multiplier))
}

/// `path[:perms]`; `perms` is any subset of `rwxRWX`, default `r`.
fn parse_file_rule(value: &str) -> Option<FileRule> {
    if value.is_empty() {
        return None;
    }
    let (path, perms_str) = match value.split_once(':') {
        Some((p, perms)) => (p, Some(perms)),
        None => (value, None),
    };
    if !path.starts_with('/') || path.is_empty() {
        return None;
    }
    let mut perms = FilePerms {
        read: false,
        write: false,
        execute: false,
    };
    match perms_str {
        None => perms.read = true,
        Some(s) => {
            if s.is_empty() {
                return None;
            }
            for c in s.chars() {
                match c {
                    'r' | 'R' => perms.read = true,
                    'w' | 'W' => perms.write = true,
                    'x' | 'X' => perms.execute = true,
                    _ => return None,
                }
            }
        }
    }
    Some(FileRule {
        path: canonicalize_path_string(path),
        perms,
    })
}

/// Strips `.`/`..` components and trailing slashes (except for `/` itself)
/// without touching the filesystem — the policy layer never stats paths.
fn canonicalize_path_string(path: &str) -> String {
    let mut components = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}

/// `protocol[:first[:second[:direction]]]`.
fn parse_network_rule(value: &str) -> Option<NetworkRule> {
    let fields: Vec<&str> = value.split(':').collect();
    if fields.is_empty() || fields[0].is_empty() {
        return None;
    }
    let protocol = match fields[0] {
        "none" => Protocol::None,
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        "unix" => Protocol::Unix,
        _ => return None,
    };

    if protocol == Protocol::None {
        if fields.len() != 1 {
            return None;
        }
        return Some(NetworkRule {
            protocol,
            address: String::new(),
            port: Port::Any,
            direction: Direction::Both,
        });
    }

    if protocol == Protocol::Unix {
        let path = fields.get(1)?;
        if path.is_empty() {
            return None;
        }
        return Some(NetworkRule {
            protocol,
            address: path.to_string(),
            port: Port::Any,
            direction: Direction::Both,
        });
    }

    // tcp/udp
    let mut address = "0.0.0.0".to_string();
    let mut port = Port::Any;
    let mut direction = Direction::Both;
    let rest = &fields[1..];

    if rest.is_empty() {
        return Some(NetworkRule {
            protocol,
            address,
            port,
            direction,
        });
    }

    // The final field, wherever it falls, sets direction if it's one of
    // the direction keywords; whatever remains (0-2 fields) is
    // address/port in order. This lets `tcp:0.0.0.0:out` (address +
    // direction, no port) and `tcp:443:out` (port + direction, no
    // address) both set direction without requiring the full four-field
    // form the grammar's longest case shows.
    let mut rest = rest;
    if let Some((last, init)) = rest.split_last() {
        direction = match *last {
            "in" | "inbound" => {
                rest = init;
                Direction::In
            }
            "out" | "outbound" => {
                rest = init;
                Direction::Out
            }
            _ => Direction::Both,
        };
    }

    match rest.len() {
        0 => {}
        1 => {
            if let Ok(p) = rest[0].parse::<u16>() {
                if p >= 1 {
                    port = Port::Number(p);
                } else {
                    address = rest[0].to_string();
                }
            } else {
                address = rest[0].to_string();
            }
        }
        _ => {
            address = rest[0].to_string();
            if let Ok(p) = rest[1].parse::<u16>() {
                if p >= 1 {
                    port = Port::Number(p);
                }
            }
        }
    }

    Some(NetworkRule {
        protocol,
        address,
        port,
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_yields_default_policy() {
        let policy = parse("");
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn test_parse_comments_and_blank_lines_ignored() {
        let policy = parse("# a comment\n\n  \nuser: auto # trailing comment\n");
        assert_eq!(policy.principal, Principal::EphemeralAuto);
    }

    #[test]
    fn test_parse_named_user() {
        let policy = parse("user: alice\n");
        assert_eq!(policy.principal, Principal::Named("alice".to_string()));
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse("memory: 64M\n").limits.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(parse("memory: 1G\n").limits.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(parse("memory: 512\n").limits.memory_bytes, 512);
        assert_eq!(parse("memory: 2k\n").limits.memory_bytes, 2048);
    }

    #[test]
    fn test_malformed_line_warns_and_continues() {
        // scenario 5 from the spec's end-to-end list: one bad line does
        // not block a later valid one.
        let policy = parse("memory: banana\nuser: auto\n");
        assert_eq!(policy.principal, Principal::EphemeralAuto);
        assert_eq!(policy.limits.memory_bytes, 0);
    }

    #[test]
    fn test_unknown_key_skipped() {
        let policy = parse("bogus: value\nuser: auto\n");
        assert_eq!(policy.principal, Principal::EphemeralAuto);
    }

    #[test]
    fn test_file_rule_default_perm_is_read() {
        let policy = parse("file: /usr/lib\n");
        assert_eq!(policy.file_rules.len(), 1);
        assert!(policy.file_rules[0].perms.read);
        assert!(!policy.file_rules[0].perms.write);
    }

    #[test]
    fn test_file_rule_explicit_perms() {
        let policy = parse("filesystem: /opt/app:rwx\n");
        let rule = &policy.file_rules[0];
        assert!(rule.perms.read && rule.perms.write && rule.perms.execute);
    }

    #[test]
    fn test_file_rule_path_canonicalized() {
        let policy = parse("file: /a/./b/../c/\n");
        assert_eq!(policy.file_rules[0].path, "/a/c");
    }

    #[test]
    fn test_file_rule_caps_count() {
        let mut doc = String::new();
        for i in 0..40 {
            doc.push_str(&format!("file: /p{i}\n"));
        }
        let policy = parse(&doc);
        assert_eq!(policy.file_rules.len(), MAX_FILE_RULES);
    }

    #[test]
    fn test_network_rule_none() {
        let policy = parse("network: none\n");
        assert_eq!(policy.network_rules[0].protocol, Protocol::None);
    }

    #[test]
    fn test_network_rule_unix() {
        let policy = parse("network: unix:/run/app.sock\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.protocol, Protocol::Unix);
        assert_eq!(rule.address, "/run/app.sock");
        assert_eq!(rule.port, Port::Any);
    }

    #[test]
    fn test_network_rule_tcp_port_only() {
        let policy = parse("network: tcp:8080\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.address, "0.0.0.0");
        assert_eq!(rule.port, Port::Number(8080));
    }

    #[test]
    fn test_network_rule_tcp_address_and_port_and_direction() {
        let policy = parse("network: tcp:10.0.0.5:443:out\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.address, "10.0.0.5");
        assert_eq!(rule.port, Port::Number(443));
        assert_eq!(rule.direction, Direction::Out);
    }

    #[test]
    fn test_network_rule_udp_inbound() {
        let policy = parse("network: udp:53:in\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.protocol, Protocol::Udp);
        assert_eq!(rule.port, Port::Number(53));
        assert_eq!(rule.direction, Direction::In);
    }

    #[test]
    fn test_network_rule_address_and_direction_no_port() {
        // two-field form: address + direction, matching what the
        // capability-detection tool emits for an outbound-only draft.
        let policy = parse("network: tcp:0.0.0.0:out\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.address, "0.0.0.0");
        assert_eq!(rule.port, Port::Any);
        assert_eq!(rule.direction, Direction::Out);
    }

    #[test]
    fn test_network_rule_port_and_direction_no_address() {
        let policy = parse("network: tcp:8080:in\n");
        let rule = &policy.network_rules[0];
        assert_eq!(rule.address, "0.0.0.0");
        assert_eq!(rule.port, Port::Number(8080));
        assert_eq!(rule.direction, Direction::In);
    }

    #[test]
    fn test_env_rule() {
        let policy = parse("env: FOO=bar\n");
        assert_eq!(policy.env_rules[0], ("FOO".to_string(), "bar".to_string()));
    }

    #[test]
    fn test_env_clear_bool_variants() {
        assert!(parse("env_clear: true\n").env_clear);
        assert!(parse("env_clear: 1\n").env_clear);
        assert!(!parse("env_clear: false\n").env_clear);
    }

    #[test]
    fn test_network_default_deny() {
        assert!(parse("network_default: deny\n").network_default_deny);
        assert!(!parse("network_default: allow\n").network_default_deny);
    }

    #[test]
    fn test_workspace_must_be_absolute() {
        let policy = parse("workspace: /tmp/demo\n");
        assert_eq!(policy.workspace_path.as_deref(), Some("/tmp/demo"));
        let rejected = parse("workspace: relative/path\n");
        assert_eq!(rejected.workspace_path, None);
    }

    #[test]
    fn test_parse_file_missing_is_caller_responsibility() {
        // parse_file on a nonexistent path is fatal; the "missing document
        // is recoverable" behavior lives in the orchestrator, which falls
        // back to `Policy::default()` with a warning instead of calling
        // parse_file at all.
        let result = parse_file(Path::new("/nonexistent/path.caps"));
        assert!(result.is_err());
    }
}
