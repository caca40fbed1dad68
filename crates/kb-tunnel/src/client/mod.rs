//! Developer-machine side of the session: SSH forwards over the bridge

pub mod connector;
pub mod forward;
mod forwarder;

pub use connector::{BridgeHandler, SshConnector};
pub use forwarder::{ClientForwarder, ClientStats};
