//! Status condition tracker.
//!
//! Conditions are keyed by `type`: at most one entry per type, kept in the
//! order types were first recorded. `last_transition_time` only moves when
//! the status of a type actually changes.

use chrono::{DateTime, Utc};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// The parent's managed stack is up.
pub const TYPE_AVAILABLE: &str = "Available";
/// The parent is being torn down.
pub const TYPE_DEGRADED: &str = "Degraded";

pub const REASON_RECONCILING: &str = "Reconciling";
pub const REASON_FINALIZING: &str = "Finalizing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Build a condition stamped with `now`; the stamp is only kept if the write is a transition.
pub fn condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.as_str().to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(now),
        observed_generation: None,
    }
}

/// Record `new` in `conditions`. Returns whether the list changed.
///
/// Same type and same status: reason, message and observed generation are
/// refreshed, the existing transition time is preserved. Otherwise the entry
/// is replaced in place (or appended) carrying `new`'s transition time.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    if existing.status != new.status {
        *existing = new;
        return true;
    }

    let mut changed = false;
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    if existing.observed_generation != new.observed_generation {
        existing.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_status(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
    find_condition(conditions, type_).map(|c| c.status == status.as_str()).unwrap_or(false)
}
