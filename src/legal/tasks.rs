//! Task lifecycle: `pending -> in_progress -> completed`, driven either by
//! checklist completion or by an explicit status change.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{ChecklistItem, TaskRecord, TaskStatus};
use crate::legal::normalize::collapse_whitespace;

pub const MAX_CHECKLIST_ITEMS: usize = 100;
const MAX_ITEM_LEN: usize = 500;

/// The lifecycle-relevant slice of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    pub status: TaskStatus,
    pub checklist: Vec<ChecklistItem>,
    pub progress: i32,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for Lifecycle {
    fn from(task: &TaskRecord) -> Self {
        Self {
            status: task.status,
            checklist: task.checklist.clone(),
            progress: task.progress,
            completed_at: task.completed_at,
        }
    }
}

/// Checklist item as submitted by a client; `id` is kept when present.
#[derive(Debug, Clone, Deserialize)]
pub struct ChecklistInput {
    pub id: Option<Uuid>,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

/// `round(done * 100 / total)`, or `None` for an empty checklist.
pub fn checklist_progress(checklist: &[ChecklistItem]) -> Option<i32> {
    if checklist.is_empty() {
        return None;
    }
    let done = checklist.iter().filter(|item| item.done).count() as f64;
    let total = checklist.len() as f64;
    Some((done * 100.0 / total).round() as i32)
}

pub fn status_for_progress(progress: i32) -> TaskStatus {
    match progress {
        p if p <= 0 => TaskStatus::Pending,
        p if p >= 100 => TaskStatus::Completed,
        _ => TaskStatus::InProgress,
    }
}

fn fallback_progress(status: TaskStatus) -> i32 {
    if status == TaskStatus::Completed { 100 } else { 0 }
}

fn completion_stamp(
    previous: &Lifecycle,
    next: TaskStatus,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match (previous.status, next) {
        (TaskStatus::Completed, TaskStatus::Completed) => previous.completed_at.or(Some(now)),
        (_, TaskStatus::Completed) => Some(now),
        _ => None,
    }
}

/// Recompute status and progress after the checklist changed.
///
/// A non-empty checklist decides the status; an empty one leaves the current
/// status in place.
pub fn derive_from_checklist(
    previous: &Lifecycle,
    checklist: Vec<ChecklistItem>,
    now: DateTime<Utc>,
) -> Lifecycle {
    let (status, progress) = match checklist_progress(&checklist) {
        Some(progress) => (status_for_progress(progress), progress),
        None => (previous.status, fallback_progress(previous.status)),
    };
    Lifecycle {
        status,
        checklist,
        progress,
        completed_at: completion_stamp(previous, status, now),
    }
}

/// Apply an explicit status change. The requested status always wins; the
/// checklist is adjusted so it agrees with it.
pub fn apply_status(previous: &Lifecycle, status: TaskStatus, now: DateTime<Utc>) -> Lifecycle {
    let mut checklist = previous.checklist.clone();
    match status {
        TaskStatus::Completed => {
            for item in &mut checklist {
                item.done = true;
            }
        }
        TaskStatus::Pending | TaskStatus::InProgress => {
            let all_done = !checklist.is_empty() && checklist.iter().all(|item| item.done);
            if all_done && let Some(last) = checklist.last_mut() {
                last.done = false;
            }
        }
    }
    let progress = checklist_progress(&checklist).unwrap_or_else(|| fallback_progress(status));
    Lifecycle {
        status,
        checklist,
        progress,
        completed_at: completion_stamp(previous, status, now),
    }
}

/// Validate and normalize a submitted checklist.
pub fn build_checklist(items: Vec<ChecklistInput>) -> Result<Vec<ChecklistItem>, String> {
    if items.len() > MAX_CHECKLIST_ITEMS {
        return Err(format!(
            "checklist may hold at most {MAX_CHECKLIST_ITEMS} items"
        ));
    }
    let mut out: Vec<ChecklistItem> = Vec::with_capacity(items.len());
    for input in items {
        let mut item = new_item(&input.text)?;
        item.done = input.done;
        if let Some(id) = input.id
            && !out.iter().any(|existing| existing.id == id)
        {
            item.id = id;
        }
        out.push(item);
    }
    Ok(out)
}

pub fn new_item(text: &str) -> Result<ChecklistItem, String> {
    let text = collapse_whitespace(text);
    if text.is_empty() {
        return Err("checklist item text is required".to_string());
    }
    if text.chars().count() > MAX_ITEM_LEN {
        return Err(format!(
            "checklist item text must be at most {MAX_ITEM_LEN} characters"
        ));
    }
    Ok(ChecklistItem {
        id: Uuid::new_v4(),
        text,
        done: false,
    })
}

/// Flip one item. Returns `None` when the item does not exist.
pub fn set_item_done(
    checklist: &[ChecklistItem],
    item_id: Uuid,
    done: bool,
) -> Option<Vec<ChecklistItem>> {
    let mut updated = checklist.to_vec();
    let item = updated.iter_mut().find(|item| item.id == item_id)?;
    item.done = done;
    Some(updated)
}

pub fn remove_item(checklist: &[ChecklistItem], item_id: Uuid) -> Option<Vec<ChecklistItem>> {
    let position = checklist.iter().position(|item| item.id == item_id)?;
    let mut updated = checklist.to_vec();
    updated.remove(position);
    Some(updated)
}
