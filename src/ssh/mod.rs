// ABOUTME: Remote shell access for configuring target hosts.
// ABOUTME: russh sessions plus a host-keyed executor with connect retry.

mod client;
mod error;
mod executor;
pub mod shell;

pub use client::{CommandOutput, Session};
pub use error::{Error, Result};
pub use executor::{
    CommandRunner, ConnectPolicy, Connector, RemoteExecutor, RemoteSession, SshConnector,
    TargetHost,
};
