//! Fleet installer for an agent/controller pair.
//!
//! Hosts come from a section-grouped inventory file and are driven one at a
//! time through shell-script workflows over SSH. The crate keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (inventory rows, line reassembly,
//!   artifact selection, run reports). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (TCP probing, the SSH transport,
//!   remote execution, transfers, templates, configuration).
//!
//! [`orchestrator`] composes both to implement the CLI workflows. A failure on
//! one host is recorded in the [`core::report::RunReport`] and never stops the
//! rest of the fleet.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
