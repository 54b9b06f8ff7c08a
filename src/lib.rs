pub mod api;
pub mod config;
pub mod error;
pub mod exec_log;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod sandbox;
pub mod store;
pub mod worker;
