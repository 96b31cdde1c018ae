//! Command line interface

mod commands;
pub mod demo;

pub use commands::{Cli, Commands};
