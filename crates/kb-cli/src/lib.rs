//! k-bridge: command-line interface for k-Bridge sessions
//!
//! Loads a session file, runs the session against the current kube
//! context, and restores Services left swapped by a crashed session.

pub mod commands;
pub mod output;
