//! kb-orchestrator: runs a k-Bridge development session
//!
//! The orchestrator checks the local machine, swaps the configured Services
//! over to the session's bridge pod, and supervises the bridge and client
//! forwarders until the session is stopped.

pub mod preflight;
pub mod session;
pub mod swap;

pub use session::{Forwarder, SessionCompletion, SessionOrchestrator};
pub use swap::{ServiceSwapManager, SwapState, BACKUP_ANNOTATION};
