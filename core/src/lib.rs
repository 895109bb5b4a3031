#![deny(missing_docs)]
//! ops_core: shared building blocks for the maintenance daemon and its CLI
//! (config, logging, job model, notifications, health, feedback, backups).

/// Configuration helpers (AppId, dirs, load_or_init, backup target).
pub mod cfg;
/// Error taxonomy shared by every component.
pub mod error;
/// Tracing/log initialization helpers.
pub mod logx;
/// Job model shared by the scheduler and the CLI: triggers and results.
pub mod job;
/// Notification sink (Slack or no-op).
pub mod notify;
/// Subprocess execution with a hard timeout.
pub mod process;
/// CPU/memory/disk sampling against thresholds.
pub mod health;
/// Dislike-ratio evaluation.
pub mod feedback;
/// File-backed feedback counters.
pub mod store;
/// Database dump, archive packaging and retention sweep.
pub mod backup;
