//! Task fingerprints.
//!
//! A fingerprint is a set of normalized terms drawn from the goal text and
//! the salient context fields, plus a SHA-256 digest of that set. Term order
//! in the input never changes the result.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Words that carry no signal for plan reuse.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "could", "do", "for", "from", "i",
    "in", "is", "it", "me", "my", "of", "on", "or", "please", "the", "then", "to", "with", "you",
];

/// Deterministic digest of a goal and its context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex SHA-256 over the sorted term set
    pub digest: String,
    /// Sorted, de-duplicated normalized terms
    pub terms: Vec<String>,
}

impl Fingerprint {
    /// Compute the fingerprint for a goal and its context fields.
    ///
    /// Context values are tokenized like the goal and namespaced by their key
    /// (`key:term`), so `{"lang": "rust"}` never collides with a goal word.
    #[must_use]
    pub fn compute(goal: &str, context: &BTreeMap<String, String>) -> Self {
        let mut terms: BTreeSet<String> = tokenize(goal).collect();

        for (key, value) in context {
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            for term in tokenize(value) {
                terms.insert(format!("{key}:{term}"));
            }
        }

        Self::from_terms(terms)
    }

    /// Build a fingerprint from an already-normalized term set.
    #[must_use]
    pub fn from_terms(terms: BTreeSet<String>) -> Self {
        let mut hasher = Sha256::new();
        for term in &terms {
            hasher.update(term.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            digest: format!("{:x}", hasher.finalize()),
            terms: terms.into_iter().collect(),
        }
    }

    /// Jaccard similarity of the two term sets (0.0 – 1.0).
    ///
    /// Identical digests always score 1.0, including two empty fingerprints.
    #[must_use]
    pub fn similarity(&self, other: &Fingerprint) -> f32 {
        if self.digest == other.digest {
            return 1.0;
        }
        let a: BTreeSet<&str> = self.terms.iter().map(String::as_str).collect();
        let b: BTreeSet<&str> = other.terms.iter().map(String::as_str).collect();
        let union = a.union(&b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(&b).count() as f32 / union as f32
    }

    /// Short form of the digest for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Split text into normalized terms.
///
/// Path-like characters (`/`, `.`, `-`, `_`) stay inside a term so that
/// `/data` and `report.csv` survive as single terms.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '/' | '.' | '-' | '_')))
        .map(|raw| raw.trim_matches(|c: char| matches!(c, '.' | '-' | '_')).to_lowercase())
        .filter(|term| !term.is_empty() && !STOPWORDS.contains(&term.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = Fingerprint::compute("list files in /data", &BTreeMap::new());
        let b = Fingerprint::compute("/data files LIST", &BTreeMap::new());
        assert_eq!(a, b);
        assert_eq!(a.terms, vec!["/data", "files", "list"]);
    }

    #[test]
    fn test_fingerprint_ignores_punctuation_and_stopwords() {
        let a = Fingerprint::compute("Please, summarize the report.", &BTreeMap::new());
        let b = Fingerprint::compute("summarize report", &BTreeMap::new());
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_context_is_namespaced() {
        let fp = Fingerprint::compute("build", &ctx(&[("Lang", "Rust")]));
        assert!(fp.terms.contains(&"lang:rust".to_string()));
        assert!(!fp.terms.contains(&"rust".to_string()));
    }

    #[test]
    fn test_context_changes_digest() {
        let plain = Fingerprint::compute("deploy service", &BTreeMap::new());
        let staged = Fingerprint::compute("deploy service", &ctx(&[("env", "staging")]));
        assert_ne!(plain.digest, staged.digest);
    }

    #[test]
    fn test_similarity() {
        let a = Fingerprint::compute("list files in /data", &BTreeMap::new());
        let b = Fingerprint::compute("list files in /tmp", &BTreeMap::new());
        // {list, files, /data} vs {list, files, /tmp}: 2 shared of 4
        assert!((a.similarity(&b) - 0.5).abs() < 0.001);
        assert!((a.similarity(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_similarity_disjoint() {
        let a = Fingerprint::compute("alpha", &BTreeMap::new());
        let b = Fingerprint::compute("beta", &BTreeMap::new());
        assert_eq!(a.similarity(&b), 0.0);
    }
}
