//! Core data model.
//!
//! A job is a persisted unit of deferred work: an action type that selects
//! the pluggable behavior, a string parameter map, and a lifecycle status.
//! The (action type, parameters) pair doubles as the dedup key — offering
//! an equal pair reuses the existing row instead of inserting a duplicate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A persisted unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Surrogate key, assigned on first persistence. Never changes.
    pub id: JobId,

    /// Which pluggable action handles this job.
    pub action_type: String,

    /// Current lifecycle status.
    pub status: Status,

    /// String parameters for the action. Sorted map, so two jobs with the
    /// same entries compare equal regardless of insertion order.
    pub parameters: BTreeMap<String, String>,

    /// When the job was first created. Not touched on dedup reuse.
    pub added: DateTime<Utc>,

    /// When the current claim started. Cleared on reset to NEW.
    pub start: Option<DateTime<Utc>>,

    /// Set only on terminal success.
    pub finished: Option<DateTime<Utc>>,

    /// Failure message, present on BROKEN jobs.
    pub error: Option<String>,
}

impl Job {
    /// Canonical dedup key for this job's parameter map.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.parameters)
    }
}

/// Canonical encoding of a parameter map, as JSON. BTreeMap iteration
/// order makes this deterministic, and JSON string escaping makes it
/// injective: no two distinct maps share an encoding.
pub(crate) fn dedup_key(parameters: &BTreeMap<String, String>) -> String {
    // A map of strings always serializes.
    serde_json::to_string(parameters).unwrap_or_default()
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting for a worker.
    New,
    /// Claimed by a worker, presumed executing.
    Processing,
    /// Done successfully. Terminal until explicitly re-offered.
    Finished,
    /// Execution failed or the worker died. Terminal until re-offered.
    Broken,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (New, Processing)
                | (Processing, Finished)
                | (Processing, Broken)
                | (Processing, New) // stall reset or inactive-action release
                | (Finished, New)   // dedup reuse via offer
                | (Broken, New) // explicit re-offer
        )
    }

    /// Is this a terminal status (no automatic progression)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Broken)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Processing => "PROCESSING",
            Status::Finished => "FINISHED",
            Status::Broken => "BROKEN",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Status::New),
            "PROCESSING" => Ok(Status::Processing),
            "FINISHED" => Ok(Status::Finished),
            "BROKEN" => Ok(Status::Broken),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for offering new jobs. The queue's public submission API.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) action_type: String,
    pub(crate) parameters: BTreeMap<String, String>,
}

impl NewJob {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_parameter_order_independent() {
        let a = NewJob::new("index").parameter("b", "2").parameter("a", "1");
        let b = NewJob::new("index").parameter("a", "1").parameter("b", "2");
        assert_eq!(dedup_key(&a.parameters), dedup_key(&b.parameters));
    }

    #[test]
    fn dedup_key_distinguishes_values() {
        let a = NewJob::new("index").parameter("a", "1");
        let b = NewJob::new("index").parameter("a", "2");
        assert_ne!(dedup_key(&a.parameters), dedup_key(&b.parameters));
    }

    #[test]
    fn dedup_key_survives_separator_characters() {
        // A single value embedding what looks like another entry must not
        // alias the map that actually has two entries.
        let smuggled = NewJob::new("index").parameter("a", "1\nb=2");
        let split = NewJob::new("index").parameter("a", "1").parameter("b", "2");
        assert_ne!(dedup_key(&smuggled.parameters), dedup_key(&split.parameters));

        let quoted = NewJob::new("index").parameter("a", "1\",\"b\":\"2");
        assert_ne!(dedup_key(&quoted.parameters), dedup_key(&split.parameters));
    }

    #[test]
    fn status_transitions() {
        use Status::*;
        assert!(New.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Finished));
        assert!(Processing.can_transition_to(Broken));
        assert!(Processing.can_transition_to(New));
        assert!(Finished.can_transition_to(New));
        assert!(Broken.can_transition_to(New));

        assert!(!New.can_transition_to(Finished));
        assert!(!New.can_transition_to(Broken));
        assert!(!Finished.can_transition_to(Processing));
        assert!(!Broken.can_transition_to(Finished));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            Status::New,
            Status::Processing,
            Status::Finished,
            Status::Broken,
        ] {
            assert_eq!(s.as_str().parse::<Status>().unwrap(), s);
        }
        assert!("QUEUED".parse::<Status>().is_err());
    }
}
