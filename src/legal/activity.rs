//! Activity entries and before/after field diffs.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{ActivityAction, ActivityStore, CreateActivityParams, EntityType, FieldChange};

/// Fields never recorded in a diff.
const IGNORED_FIELDS: &[&str] = &[
    "updated_at",
    "password",
    "password_hash",
    "reminder_sent_at",
];

/// Field-level differences between two serialized records.
///
/// Arrays and nested objects compare as whole values.
pub fn diff_fields<T: Serialize>(before: &T, after: &T) -> Vec<FieldChange> {
    let (Ok(Value::Object(before)), Ok(Value::Object(after))) =
        (serde_json::to_value(before), serde_json::to_value(after))
    else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| !IGNORED_FIELDS.contains(&key.as_str()))
        .filter_map(|key| {
            let old = before.get(key).cloned().unwrap_or(Value::Null);
            let new = after.get(key).cloned().unwrap_or(Value::Null);
            (old != new).then(|| FieldChange {
                field: key.clone(),
                before: old,
                after: new,
            })
        })
        .collect()
}

/// Snapshot of a created or deleted record, as a diff against nothing.
pub fn snapshot<T: Serialize>(record: &T, created: bool) -> Vec<FieldChange> {
    let Ok(Value::Object(map)) = serde_json::to_value(record) else {
        return Vec::new();
    };
    map.into_iter()
        .filter(|(key, _)| !IGNORED_FIELDS.contains(&key.as_str()))
        .filter(|(_, value)| !value.is_null())
        .map(|(field, value)| {
            let (before, after) = if created {
                (Value::Null, value)
            } else {
                (value, Value::Null)
            };
            FieldChange {
                field,
                before,
                after,
            }
        })
        .collect()
}

/// Builder for one activity entry.
#[derive(Debug, Clone)]
pub struct Entry {
    params: CreateActivityParams,
}

impl Entry {
    pub fn new(
        actor_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
        action: ActivityAction,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            params: CreateActivityParams {
                actor_id: Some(actor_id),
                entity_type,
                entity_id,
                action,
                summary: summary.into(),
                changes: Vec::new(),
                recipients: Vec::new(),
            },
        }
    }

    /// Entry without a human actor, e.g. written by the reminder worker.
    pub fn system(
        entity_type: EntityType,
        entity_id: Uuid,
        action: ActivityAction,
        summary: impl Into<String>,
    ) -> Self {
        let mut entry = Self::new(Uuid::nil(), entity_type, entity_id, action, summary);
        entry.params.actor_id = None;
        entry
    }

    pub fn changes(mut self, changes: Vec<FieldChange>) -> Self {
        self.params.changes = changes;
        self
    }

    pub fn notify(mut self, recipients: impl IntoIterator<Item = Uuid>) -> Self {
        self.params.recipients.extend(recipients);
        self
    }

    pub fn params(&self) -> &CreateActivityParams {
        &self.params
    }

    /// Persist the entry. Failures are logged; the caller's write already
    /// succeeded and must not be reported as failed.
    pub async fn record(self, store: &dyn ActivityStore) {
        if let Err(e) = store.record_activity(&self.params).await {
            tracing::warn!(
                entity_type = self.params.entity_type.as_str(),
                entity_id = %self.params.entity_id,
                action = self.params.action.as_str(),
                "failed to record activity: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Sample {
        name: String,
        tags: Vec<&'static str>,
        phone: Option<String>,
        updated_at: &'static str,
        password_hash: &'static str,
    }

    fn sample() -> Sample {
        Sample {
            name: "Jane".into(),
            tags: vec!["a", "b"],
            phone: None,
            updated_at: "2025-01-01",
            password_hash: "x",
        }
    }

    #[test]
    fn unchanged_records_produce_no_diff() {
        assert!(diff_fields(&sample(), &sample()).is_empty());
    }

    #[test]
    fn ignored_fields_never_appear() {
        let mut after = sample();
        after.updated_at = "2025-02-02";
        after.password_hash = "y";
        assert!(diff_fields(&sample(), &after).is_empty());
    }

    #[test]
    fn arrays_compare_as_whole_values() {
        let mut after = sample();
        after.tags = vec!["a", "c"];
        after.phone = Some("555 0100".into());
        let changes = diff_fields(&sample(), &after);
        assert_eq!(
            changes,
            vec![
                FieldChange {
                    field: "phone".into(),
                    before: Value::Null,
                    after: json!("555 0100"),
                },
                FieldChange {
                    field: "tags".into(),
                    before: json!(["a", "b"]),
                    after: json!(["a", "c"]),
                },
            ]
        );
    }

    #[test]
    fn snapshot_skips_nulls_and_secrets() {
        let changes = snapshot(&sample(), true);
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "tags"]);
        assert!(changes.iter().all(|c| c.before.is_null()));
    }

    #[test]
    fn system_entries_have_no_actor() {
        let entry = Entry::system(EntityType::Task, Uuid::new_v4(), ActivityAction::Reminder, "due");
        assert_eq!(entry.params().actor_id, None);
    }
}
