//! Infrastructure layer for storage, the remote API and process plumbing
//!
//! This module provides the SQLite and in-memory stores, the DataMaster HTTP
//! client, configuration loading and logging setup.

pub mod config; // Configuration file, env overrides and defaults
pub mod database_connection;
pub mod datamaster_client;
pub mod logging; // Logging infrastructure
pub mod memory_store;
pub mod phone_repository;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager};
pub use database_connection::DatabaseConnection;
pub use datamaster_client::{DataMasterClient, SourceError};
pub use logging::{get_log_directory, init_logging_with_config};
pub use memory_store::MemoryStore;
pub use phone_repository::SqlitePhoneStore;
