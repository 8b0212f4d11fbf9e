//! # at-remote
//!
//! Remote execution client for AutoTune compute targets.
//!
//! A [`Transport`] is one logical connection to a machine; [`SshTransport`]
//! reaches remote hosts through the system ssh client and [`LocalTransport`]
//! treats this machine as the target. [`RemoteSession`] layers the working
//! directory layout and the payload runner contract on top of a transport.

pub mod local;
pub mod paths;
mod process;
pub mod session;
pub mod ssh;
pub mod transport;

pub use local::LocalTransport;
pub use paths::{adjust_payload_paths, remote_path_for, LogicalPath, PathCategory};
pub use session::{test_connection, ConnectionTest, Entrypoint, RemoteSession};
pub use ssh::SshTransport;
pub use transport::{shell_quote, CommandOutput, RemoteEntry, Transport};

use at_types::ComputeTarget;

/// Transport for `target`, or the local machine when there is none.
pub fn transport_for(target: Option<&ComputeTarget>) -> Box<dyn Transport> {
    match target {
        Some(target) => Box::new(SshTransport::new(target.clone())),
        None => Box::new(LocalTransport::new()),
    }
}
