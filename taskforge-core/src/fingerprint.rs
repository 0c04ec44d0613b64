//! Content-addressed fingerprints and the comparator that decides whether
//! two of them are "the same" from the point of view of invalidation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An opaque value associated with one output name. Equality between two
/// fingerprints is never compared directly by the scheduler; it is always
/// delegated to the producing job's [`crate::job::Job::compare_hashes`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Fingerprint {
    /// `{hash, size, mtime}` for a file-like output. Equality requires hash
    /// equality only; size/mtime are hints a job may use to skip rehashing.
    File {
        hash: String,
        size: u64,
        mtime_secs: i64,
    },
    /// A stable hash of an in-memory value (parameter/function invariants).
    Value(String),
}

impl Fingerprint {
    pub fn hash_str(&self) -> &str {
        match self {
            Fingerprint::File { hash, .. } => hash,
            Fingerprint::Value(hash) => hash,
        }
    }
}

/// What actually flows through a job's output map. Most entries are
/// `Value`; the `Force`/`Ignore` sentinels are only ever produced by
/// conditional-run probes (§4.3) and short-circuit the comparator instead of
/// being compared as ordinary fingerprints. Modeled as an explicit variant
/// rather than the string sentinels `"ExplodePlease"` / `"IgnorePlease"` of
/// the original system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProbeResult {
    /// Force invalidation of the consumer of this value.
    Force,
    /// Force the consumer of this value to be treated as unchanged.
    Ignore,
    /// An ordinary fingerprint, compared via the owning job's comparator.
    Value(Fingerprint),
}

impl ProbeResult {
    pub fn as_value(&self) -> Option<&Fingerprint> {
        match self {
            ProbeResult::Value(fp) => Some(fp),
            _ => None,
        }
    }
}

impl From<Fingerprint> for ProbeResult {
    fn from(fp: Fingerprint) -> Self {
        ProbeResult::Value(fp)
    }
}

pub type FingerprintMap = HashMap<String, ProbeResult>;

/// Compares an old and a new entry for the same output name, deferring to
/// the producing job's own notion of equality for ordinary values, and
/// short-circuiting for probe sentinels. Returns `true` when the two are
/// considered equal (i.e. not invalidating).
pub fn compare(
    old: Option<&ProbeResult>,
    new: &ProbeResult,
    compare_hashes: impl FnOnce(&Fingerprint, &Fingerprint) -> bool,
) -> bool {
    match new {
        ProbeResult::Ignore => true,
        ProbeResult::Force => false,
        ProbeResult::Value(new_fp) => match old {
            None => false,
            Some(ProbeResult::Value(old_fp)) => compare_hashes(old_fp, new_fp),
            Some(_) => false,
        },
    }
}

/// The rename heuristic: given a lost historical key's value, find the new
/// input(s) whose fingerprint matches it byte-for-byte (not delegated to
/// any job's comparator -- renaming is about identity of the upstream
/// output, not the inner comparison rule). Exactly one match means "this is
/// the same upstream output under a new name"; zero or several means we
/// cannot tell, so the caller invalidates to be safe.
pub fn count_rename_candidates(new_input: &FingerprintMap, lost: &ProbeResult) -> usize {
    let lost_fp = match lost.as_value() {
        Some(fp) => fp,
        None => return 0,
    };
    new_input
        .values()
        .filter(|candidate| match candidate.as_value() {
            Some(fp) => match (fp, lost_fp) {
                (Fingerprint::File { hash: h1, .. }, Fingerprint::File { hash: h2, .. }) => {
                    h1 == h2
                }
                (Fingerprint::Value(a), Fingerprint::Value(b)) => a == b,
                _ => false,
            },
            None => false,
        })
        .count()
}
