//! Log masking.
//!
//! Every byte of step output passes through a per-build [`LogMasker`] before
//! it is persisted, broadcast or displayed.

use std::sync::RwLock;

/// Minimum length of a maskable value. Shorter values would shred ordinary
/// output (think masking "a" or "no").
const MIN_SECRET_LEN: usize = 3;

const MASK: &str = "***";

/// A per-build set of literal secret values.
#[derive(Debug, Default)]
pub struct LogMasker {
    /// Kept sorted by length, longest first, so overlapping values mask the
    /// longest match.
    values: RwLock<Vec<String>>,
}

impl LogMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Idempotent; empty and short values are
    /// rejected.
    pub fn register(&self, value: &str) -> bool {
        if value.len() < MIN_SECRET_LEN {
            return false;
        }
        let mut values = self.values.write().expect("masker poisoned");
        if values.iter().any(|existing| existing == value) {
            return true;
        }
        values.push(value.to_string());
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        true
    }

    /// Replace every occurrence of any registered value with `***`.
    pub fn mask(&self, line: &str) -> String {
        let values = self.values.read().expect("masker poisoned");
        if values.is_empty() {
            return line.to_string();
        }
        let mut out = line.to_string();
        for value in values.iter() {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.values.read().expect("masker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_registered_values() {
        let masker = LogMasker::new();
        assert!(masker.register("hunter2"));
        assert_eq!(masker.mask("password is hunter2!"), "password is ***!");
    }

    #[test]
    fn masks_every_occurrence() {
        let masker = LogMasker::new();
        masker.register("tok_abc");
        assert_eq!(masker.mask("tok_abc tok_abc"), "*** ***");
    }

    #[test]
    fn registration_is_idempotent() {
        let masker = LogMasker::new();
        assert!(masker.register("secret"));
        assert!(masker.register("secret"));
        assert_eq!(masker.len(), 1);
    }

    #[test]
    fn rejects_short_and_empty_values() {
        let masker = LogMasker::new();
        assert!(!masker.register(""));
        assert!(!masker.register("ab"));
        assert!(masker.register("abc"));
    }

    #[test]
    fn longest_value_masks_first() {
        let masker = LogMasker::new();
        masker.register("abc");
        masker.register("abcdef");
        // The longer value must not be left half-masked.
        assert_eq!(masker.mask("x abcdef y"), "x *** y");
    }

    #[test]
    fn unregistered_lines_pass_through() {
        let masker = LogMasker::new();
        masker.register("secret");
        assert_eq!(masker.mask("nothing to hide"), "nothing to hide");
    }
}
