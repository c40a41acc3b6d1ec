#![warn(missing_docs)]

//! crawlstash management: operator CLI for recovery reports, statistics, orphan cleanup and metadata repair

pub mod cli;

pub use cli::{Cli, Command};
