//! The shared `Condition` shape both CRDs' status carry. Mirrors
//! the standard Kubernetes condition convention rather than inventing a new
//! one — `type`/`status`/`reason`/`message`/`lastTransitionTime`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// Distinct reason string drawn from a closed enumeration, e.g.
    /// `"CredentialError"`, `"ActiveNodePools"`, `"ProvisioningFailed"`.
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Inserts or replaces the condition of the same `type_`, updating
/// `last_transition_time` only if the status actually changed — matches the
/// Kubernetes convention of not bumping the timestamp on an unchanged
/// condition.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn set_condition_appends_when_absent() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new("Ready", ConditionStatus::True, "Healthy", "ok", now()));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn set_condition_updates_message_without_changing_timestamp_on_same_status() {
        let mut conditions = vec![Condition::new("Ready", ConditionStatus::True, "Healthy", "ok", now())];
        let later = now() + chrono::Duration::hours(1);
        set_condition(&mut conditions, Condition::new("Ready", ConditionStatus::True, "Healthy", "still ok", later));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "still ok");
        assert_eq!(conditions[0].last_transition_time, now());
    }

    #[test]
    fn set_condition_replaces_on_status_change() {
        let mut conditions = vec![Condition::new("Ready", ConditionStatus::True, "Healthy", "ok", now())];
        let later = now() + chrono::Duration::hours(1);
        set_condition(&mut conditions, Condition::new("Ready", ConditionStatus::False, "CredentialError", "bad creds", later));
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].last_transition_time, later);
    }

    #[test]
    fn find_condition_locates_by_type() {
        let conditions = vec![Condition::new("Ready", ConditionStatus::True, "Healthy", "ok", now())];
        assert!(find_condition(&conditions, "Ready").is_some());
        assert!(find_condition(&conditions, "DeletionBlocked").is_none());
    }
}
