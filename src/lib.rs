//! Chat Data Import Library
//!
//! Reconciling importer for exported chat snapshots. This module exports the
//! core components for the CLI and for testing.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod snapshot;
