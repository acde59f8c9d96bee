//! Identifier generation for physical tables, versions and migrations.

use rkyv::{Archive, Deserialize, Serialize};

/// Number of hex characters in a generated identifier suffix.
const SUFFIX_LEN: usize = 10;

/// Get the current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Generate a unique migration ID.
pub fn generate_migration_id() -> [u8; 16] {
    let ts = current_timestamp();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&ts.to_be_bytes());
    hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());

    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&hasher.finalize().as_bytes()[0..8]);
    id
}

/// Render a migration ID as hex.
pub fn migration_id_hex(id: &[u8; 16]) -> String {
    hex::encode(id)
}

/// Parse a migration ID from hex.
pub fn parse_migration_id(text: &str) -> Option<[u8; 16]> {
    hex::decode(text).ok()?.try_into().ok()
}

/// Deterministic generator of short unique names.
///
/// Names are `<prefix>_<10 hex chars>`, derived from a seed with blake3.
/// The generator is owned by whoever needs names (a plan, a changelog) and
/// has no process-wide state.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct IdGenerator {
    seed: String,
    counter: u64,
}

impl IdGenerator {
    /// Create a generator with an explicit seed.
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            counter: 0,
        }
    }

    /// Create a generator seeded from the clock.
    pub fn from_clock() -> Self {
        Self::new(format!("clock:{}", current_timestamp()))
    }

    /// Number of names handed out by [`IdGenerator::next`] since the last reset.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Produce the next sequential name that `is_taken` does not reject.
    pub fn next(&mut self, prefix: &str, is_taken: impl Fn(&str) -> bool) -> String {
        loop {
            self.counter += 1;
            let candidate = self.format(prefix, &[&self.counter.to_string()], 0);
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }

    /// Produce a name that depends only on the seed and `parts`.
    ///
    /// Calling this twice with the same parts yields the same name unless the
    /// first one has since been taken.
    pub fn derive(&self, prefix: &str, parts: &[&str], is_taken: impl Fn(&str) -> bool) -> String {
        let mut attempt = 0u32;
        loop {
            let candidate = self.format(prefix, parts, attempt);
            if !is_taken(&candidate) {
                return candidate;
            }
            attempt += 1;
        }
    }

    /// Reset the sequential counter.
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    fn format(&self, prefix: &str, parts: &[&str], attempt: u32) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.seed.as_bytes());
        for part in parts {
            hasher.update(&[0]);
            hasher.update(part.as_bytes());
        }
        hasher.update(&attempt.to_be_bytes());
        let digest = hex::encode(hasher.finalize().as_bytes());
        format!("{}_{}", prefix, &digest[..SUFFIX_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_names_are_unique() {
        let mut ids = IdGenerator::new("seed");
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let name = ids.next("table", |n| seen.contains(n));
            assert!(name.starts_with("table_"));
            assert_eq!(name.len(), "table_".len() + SUFFIX_LEN);
            seen.insert(name);
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(ids.counter(), 100);
    }

    #[test]
    fn test_reset_replays_sequence() {
        let mut ids = IdGenerator::new("seed");
        let first = ids.next("v", |_| false);
        ids.reset();
        assert_eq!(ids.next("v", |_| false), first);
    }

    #[test]
    fn test_derive_is_stable_and_skips_taken() {
        let ids = IdGenerator::new("plan");
        let a = ids.derive("table", &["v1", "users"], |_| false);
        let b = ids.derive("table", &["v1", "users"], |_| false);
        assert_eq!(a, b);

        let c = ids.derive("table", &["v1", "users"], |n| n == a);
        assert_ne!(a, c);

        let other = IdGenerator::new("other");
        assert_ne!(other.derive("table", &["v1", "users"], |_| false), a);
    }

    #[test]
    fn test_migration_id_hex() {
        let id = generate_migration_id();
        let text = migration_id_hex(&id);
        assert_eq!(text.len(), 32);
        assert_eq!(parse_migration_id(&text), Some(id));
        assert_eq!(parse_migration_id("zz"), None);
    }
}
