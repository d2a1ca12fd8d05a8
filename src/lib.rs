pub mod config;
pub mod error;
pub mod exposition;
pub mod logging;
pub mod models;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
pub mod tracker;
