//! Per-invocation unique tag generation (§4.5 step 1).
//!
//! The tag names the container, the ephemeral principal (if any), and the
//! root directory for one invocation. It must be unique across
//! concurrent invocations on the same host; process id alone is not
//! sufficient (pids recycle quickly under load), so it is combined with
//! a random suffix.

use std::process;

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generates `isolate-<pid>-<random>`, e.g. `isolate-48213-k3f9qz2m`.
pub fn generate() -> String {
    let pid = process::id();
    let suffix = nanoid::nanoid!(8, &ALPHABET);
    format!("isolate-{pid}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_has_expected_prefix() {
        let tag = generate();
        assert!(tag.starts_with("isolate-"));
    }

    #[test]
    fn test_generate_is_unique_across_calls() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate()), "tag collision within a single process");
        }
    }
}
