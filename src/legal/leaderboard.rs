//! Leaderboard scoring over task outcomes.

use serde::Serialize;
use uuid::Uuid;

use crate::db::{LeaderboardRow, Role};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;
const MAX_WINDOW_DAYS: i64 = 365;

const COMPLETED_POINTS: i64 = 10;
const ON_TIME_POINTS: i64 = 5;
const OVERDUE_PENALTY: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
    pub completed: i64,
    pub on_time: i64,
    pub overdue_open: i64,
    pub score: i64,
}

pub fn clamp_days(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_WINDOW_DAYS).clamp(1, MAX_WINDOW_DAYS)
}

/// Floored at zero.
pub fn score(row: &LeaderboardRow) -> i64 {
    (row.completed * COMPLETED_POINTS + row.on_time * ON_TIME_POINTS
        - row.overdue_open * OVERDUE_PENALTY)
        .max(0)
}

/// Sort by score, then completions, then name; equal scores share a dense rank.
pub fn rank(rows: Vec<LeaderboardRow>) -> Vec<LeaderboardEntry> {
    let mut scored: Vec<(i64, LeaderboardRow)> =
        rows.into_iter().map(|row| (score(&row), row)).collect();
    scored.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .cmp(a_score)
            .then_with(|| b.completed.cmp(&a.completed))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    let mut out = Vec::with_capacity(scored.len());
    let mut rank = 0u32;
    let mut previous: Option<i64> = None;
    for (score, row) in scored {
        if previous != Some(score) {
            rank += 1;
            previous = Some(score);
        }
        out.push(LeaderboardEntry {
            rank,
            user_id: row.user_id,
            name: row.name,
            role: row.role,
            completed: row.completed,
            on_time: row.on_time,
            overdue_open: row.overdue_open,
            score,
        });
    }
    out
}
