//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod cleanup;
pub mod container;
pub mod host;
pub mod migrate;
pub mod ports;
pub mod stack;
