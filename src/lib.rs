// Library surface for headless/integration tests and reuse.
// Keep this lean to avoid coupling to bin-only types in main.rs.
pub mod app;
pub mod app_dirs;
pub mod audit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod round;
pub mod runtime;
pub mod store;
pub mod ui;
pub mod voting;
