//! Command-line interface for oddsgate.

mod commands;
pub mod icons;

pub use commands::{is_verbose, run};
