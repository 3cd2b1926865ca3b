pub mod agent;
pub mod analysis;
pub mod catalog;
pub mod config;
pub mod diff;
pub mod draft;
pub mod error;
pub mod lease;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod preflight;
pub mod processor;
pub mod prompt;
pub mod queue;
pub mod reconcile;
pub mod records;
pub mod score;
pub mod store;
pub mod types;
pub mod worker;
pub mod worklog;
