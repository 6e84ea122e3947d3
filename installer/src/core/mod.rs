//! Deterministic, pure logic shared by the installer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod artifact;
pub mod inventory;
pub mod lines;
pub mod privilege;
pub mod remote_exit;
pub mod report;
pub mod types;
