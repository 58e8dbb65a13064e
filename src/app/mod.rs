pub mod apps;
pub mod config;
pub mod device;
pub mod error;
pub mod locks;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod tools;
pub mod watcher;
