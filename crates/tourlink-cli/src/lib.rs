//! tourlink CLI library
//!
//! Argument parsing, error types and the simulated tour runner behind the
//! `tourlink` binary.

pub mod cli;
pub mod error;
pub mod simulate;

pub use cli::{Cli, Commands};
pub use error::{CliError, Result};
pub use simulate::SimulationPlan;
