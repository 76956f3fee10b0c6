// ABOUTME: Library root for shipwright - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod cert;
pub mod config;
pub mod deploy;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod infra;
pub mod output;
pub mod pipeline;
pub mod ssh;
pub mod template;
pub mod types;
pub mod verify;
