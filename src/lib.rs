//! lexdesk: practice management API for law firms.
//!
//! Matters, case files, documents, tasks, invoices and notices, served over
//! a JSON REST API with role-scoped access.

pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod legal;
pub mod settings;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;
