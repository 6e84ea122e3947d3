//! Side-effecting operations: probing, remote execution, transfers, files.

pub mod artifact;
pub mod config;
pub mod console;
pub mod executor;
pub mod inventory;
pub mod probe;
pub mod process;
pub mod shell;
pub mod ssh;
pub mod templates;
pub mod transfer;
pub mod transport;
