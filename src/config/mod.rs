//! Configuration parsing for `warren.conf`.
//!
//! This module handles parsing of the daemon's own configuration file:
//! process-wide settings plus one section per tracker the daemon links to.

mod parser;

pub use parser::{DaemonConfig, TrackerConfig, WarrenConfig};
