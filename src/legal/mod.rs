//! Practice rules: who may see what, how money and numbers are computed,
//! and the background reminder sweep.

pub mod access;
pub mod activity;
pub mod audit;
pub mod billing;
pub mod leaderboard;
pub mod normalize;
pub mod numbering;
pub mod reminders;
pub mod tasks;
pub mod uploads;
