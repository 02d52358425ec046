//! Shadow reconciliation primitives.
//!
//! Pure helpers for keeping a local device view and a hub-side shadow in
//! step. Key concepts:
//!
//! - **Desired fields**: configuration pushed from the platform to the hub.
//!   The platform is authoritative for these.
//! - **Reported fields**: state the device reports through the hub. The hub is
//!   authoritative for these.
//! - **Drift**: a tracked reported field whose observed value differs from the
//!   last value the platform knew about.
//!
//! # Invariants
//!
//! - A [`SyncPolicy`] partitions fields by direction; a field is never both
//!   desired and reported
//! - Desired patches never contain reported fields
//! - Decisions are deterministic given the same inputs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A JSON object keyed by field name, with stable key order.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A field is mapped in both directions.
    #[error("field '{0}' is both desired and reported")]
    OverlappingField(String),

    /// A desired mapping targets an empty shadow field name.
    #[error("local attribute '{0}' maps to an empty shadow field")]
    EmptyShadowField(String),
}

/// Which local attributes map to which shadow fields, and which reported
/// fields are tracked for drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Local attribute name -> desired shadow field name. Empty means every
    /// local attribute is pushed under its own name.
    #[serde(default)]
    pub desired: BTreeMap<String, String>,

    /// Reported shadow fields compared for drift. Empty means every reported
    /// field is tracked.
    #[serde(default)]
    pub reported: BTreeSet<String>,
}

impl SyncPolicy {
    /// Checks that desired and reported fields are disjoint.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        for (local, shadow) in &self.desired {
            if shadow.is_empty() {
                return Err(ReconcileError::EmptyShadowField(local.clone()));
            }
            if self.reported.contains(shadow) {
                return Err(ReconcileError::OverlappingField(shadow.clone()));
            }
        }
        Ok(())
    }

    /// Whether a shadow field is owned by the device side.
    pub fn is_reported(&self, field: &str) -> bool {
        self.reported.contains(field)
    }

    /// Whether a reported field participates in drift detection.
    pub fn tracks(&self, field: &str) -> bool {
        self.reported.is_empty() || self.reported.contains(field)
    }

    /// Translates local attributes into the desired shadow fields to push.
    ///
    /// Attributes without a mapping are dropped, as is anything that would
    /// land on a reported field.
    pub fn desired_patch(&self, attributes: &Fields) -> Fields {
        attributes
            .iter()
            .filter_map(|(local, value)| {
                let field = if self.desired.is_empty() {
                    Some(local)
                } else {
                    self.desired.get(local)
                };
                field.map(|field| (field, value))
            })
            .filter(|(field, _)| !self.is_reported(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }

    /// Drops reported fields from a desired-side patch supplied verbatim.
    pub fn filter_desired(&self, patch: &Fields) -> Fields {
        patch
            .iter()
            .filter(|(field, _)| !self.is_reported(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }

    /// Tracked reported fields whose observed value differs from the known one.
    ///
    /// A tracked field that disappeared from the observed document shows up as
    /// a change to `null`.
    pub fn reported_drift(&self, known: &Fields, observed: &Fields) -> Fields {
        let mut changes = Fields::new();

        for (field, value) in observed {
            if self.tracks(field) && known.get(field) != Some(value) {
                changes.insert(field.clone(), value.clone());
            }
        }
        for field in known.keys() {
            if self.tracks(field) && !observed.contains_key(field) {
                changes.insert(field.clone(), serde_json::Value::Null);
            }
        }

        changes
    }
}

/// Result of comparing an observed shadow with the known state.
#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    /// Every tracked field matches.
    InSync,

    /// The observed snapshot is older than what is already known.
    Stale { known: u64, observed: u64 },

    /// One or more tracked fields changed.
    Drifted(Fields),
}

impl DriftOutcome {
    pub fn is_drifted(&self) -> bool {
        matches!(self, DriftOutcome::Drifted(_))
    }
}

/// Compares an observed shadow against the known state.
///
/// `known_version` is the shadow version the known state was taken from, if
/// any. Observations with an older version are stale and never produce drift.
pub fn detect_drift(
    policy: &SyncPolicy,
    known: &Fields,
    known_version: Option<u64>,
    observed: &Fields,
    observed_version: u64,
) -> DriftOutcome {
    if let Some(known_version) = known_version {
        if observed_version < known_version {
            return DriftOutcome::Stale {
                known: known_version,
                observed: observed_version,
            };
        }
    }

    let changes = policy.reported_drift(known, observed);
    if changes.is_empty() {
        DriftOutcome::InSync
    } else {
        DriftOutcome::Drifted(changes)
    }
}

/// A digest over canonical JSON, for deriving stable occurrence keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateDigest(String);

impl StateDigest {
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(json, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writes JSON with object keys sorted and no whitespace.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Exponential backoff for delivery retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Number of failed attempts after which retries stop.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Default delay before the first redelivery.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default cap on a single redelivery delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30 * 60); // 30 minutes

/// Default delivery attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
