//! Periodic sweep that reminds assignees about tasks coming due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{MAX_HOURS, ReminderConfig};
use crate::db::{ActivityAction, Database, EntityType, TaskRecord, UpdateTaskParams};
use crate::email::{Mailer, TaskEmail};
use crate::error::DatabaseError;
use crate::legal::activity::Entry;

/// Start the sweep loop. It stops when `shutdown` flips to `true` or its
/// sender is dropped.
pub fn spawn(
    db: Arc<dyn Database>,
    mailer: Arc<Mailer>,
    config: ReminderConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = config.interval_secs,
            lead_hours = config.lead_hours,
            "task reminder worker started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep(db.as_ref(), &mailer, config.lead_hours, Utc::now()).await {
                        Ok(0) => {}
                        Ok(sent) => tracing::info!(tasks = sent, "sent task reminders"),
                        Err(e) => tracing::warn!("task reminder sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("task reminder worker stopped");
    })
}

/// One pass: remind every open, unreminded task due within `lead_hours`.
/// Returns how many tasks were processed.
pub async fn sweep(
    db: &dyn Database,
    mailer: &Mailer,
    lead_hours: u64,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let horizon = i64::try_from(lead_hours.min(MAX_HOURS))
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|lead| now.checked_add_signed(lead))
        .unwrap_or(now);
    let due = db.tasks_due_for_reminder(horizon.date_naive()).await?;
    let mut processed = 0;
    for task in due {
        remind(db, mailer, &task, now).await?;
        processed += 1;
    }
    Ok(processed)
}

async fn remind(
    db: &dyn Database,
    mailer: &Mailer,
    task: &TaskRecord,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let matter_label = db
        .get_matter(task.matter_id)
        .await?
        .map(|m| format!("{} {}", m.matter_number, m.title))
        .unwrap_or_else(|| task.matter_id.to_string());
    let assignees = db.get_users_by_ids(&task.assignee_ids).await?;

    for user in assignees.iter().filter(|u| u.is_active) {
        let email = TaskEmail {
            recipient: user.name.clone(),
            title: task.title.clone(),
            matter: matter_label.clone(),
            due_on: task.due_on,
            priority: task.priority.as_str().to_string(),
            status: task.status.as_str().to_string(),
            progress: task.progress,
        };
        mailer.deliver(mailer.task_reminder(&user.email, &email)).await;
    }

    let due = task
        .due_on
        .map(|d| d.to_string())
        .unwrap_or_else(|| "soon".to_string());
    Entry::system(
        EntityType::Task,
        task.id,
        ActivityAction::Reminder,
        format!("Task \"{}\" is due {}", task.title, due),
    )
    .notify(task.assignee_ids.iter().copied())
    .record(db)
    .await;

    db.update_task(
        task.id,
        &UpdateTaskParams {
            reminder_sent_at: Some(Some(now)),
            ..UpdateTaskParams::default()
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tokio::sync::watch;

    use super::*;
    use crate::db::{Page, TaskStatus};
    use crate::email::testing::RecordingSender;
    use crate::testing::{seed_matter, seed_task, seed_user, test_db};

    #[tokio::test]
    async fn sweep_reminds_once_and_skips_completed() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Admin", crate::db::Role::Admin).await;
        let member = seed_user(db.as_ref(), "Mia", crate::db::Role::Member).await;
        let matter = seed_matter(db.as_ref(), admin.id, None, vec![member.id]).await;
        let today = Utc::now().date_naive();

        let due = seed_task(db.as_ref(), matter.id, admin.id, vec![member.id], Some(today)).await;
        let later =
            seed_task(db.as_ref(), matter.id, admin.id, vec![member.id], Some(today + Duration::days(10))).await;
        let done = seed_task(db.as_ref(), matter.id, admin.id, vec![member.id], Some(today)).await;
        db.update_task(
            done.id,
            &UpdateTaskParams {
                status: Some(TaskStatus::Completed),
                ..UpdateTaskParams::default()
            },
        )
        .await
        .unwrap();

        let sender = Arc::new(RecordingSender::default());
        let mailer = Mailer::new("noreply@firm.test", sender.clone()).unwrap();

        let processed = sweep(db.as_ref(), &mailer, 24, Utc::now()).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert!(db.get_task(due.id).await.unwrap().unwrap().reminder_sent_at.is_some());
        assert!(db.get_task(later.id).await.unwrap().unwrap().reminder_sent_at.is_none());

        let again = sweep(db.as_ref(), &mailer, 24, Utc::now()).await.unwrap();
        assert_eq!(again, 0);

        let notes = db.list_notifications(member.id, true, Page::default()).await.unwrap();
        assert_eq!(notes.total, 1);
        assert_eq!(notes.items[0].activity.action, ActivityAction::Reminder);
    }

    #[tokio::test]
    async fn sweep_caps_lead_time_at_a_year() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Admin", crate::db::Role::Admin).await;
        let member = seed_user(db.as_ref(), "Mia", crate::db::Role::Member).await;
        let matter = seed_matter(db.as_ref(), admin.id, None, vec![member.id]).await;
        let today = Utc::now().date_naive();
        seed_task(db.as_ref(), matter.id, admin.id, vec![member.id], Some(today + Duration::days(300))).await;
        seed_task(db.as_ref(), matter.id, admin.id, vec![member.id], Some(today + Duration::days(3000))).await;

        let mailer = Mailer::new("noreply@firm.test", Arc::new(crate::email::LogEmailSender)).unwrap();
        let processed = sweep(db.as_ref(), &mailer, u64::MAX, Utc::now()).await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let (db, _dir) = test_db().await;
        let mailer = Arc::new(Mailer::new("noreply@firm.test", Arc::new(crate::email::LogEmailSender)).unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = spawn(
            db,
            mailer,
            ReminderConfig {
                enabled: true,
                interval_secs: 3600,
                lead_hours: 24,
            },
            rx,
        );
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("worker exits")
            .expect("join");
    }
}
