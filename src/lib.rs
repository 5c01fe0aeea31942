//! Builder for pacman's what-provides file database.
//!
//! This library provides the underlying functionality of the
//! `pacman-providesdb` binary.
//!
//! It implements the following features:
//! - short-fetching a prefix of each package archive and pulling the
//!   `.MTREE` file list straight out of the partial tar stream, with a
//!   full-fetch fallback for unusual archives
//! - concurrent per-mirror workers with per-package timeouts, backup
//!   mirrors, and a multi-phase retry pipeline
//! - incremental updates: only packages whose version changed since the
//!   last run are fetched again
//! - a gzip-compressed JSON database with migration from its legacy
//!   format

/// Archive member probe and full tar extraction.
pub mod archive;
/// Streaming xz/gz decompression.
pub mod compress;
/// Runtime configuration and its defaults.
pub mod config;
/// The on-disk database: read, migrate, diff, write.
pub mod db;
/// HTTP byte-range and full-body fetching.
pub mod fetch;
/// Helpers
pub mod helpers;
/// `.MTREE` file list parsing.
pub mod mtree;
/// Mirror list and package list providers.
pub mod providers;
/// Worker fan-out and cooperative cancellation.
pub mod runner;
/// The per-package fetch/probe/decode state machine.
pub mod task;
/// Common types.
pub mod types;
/// The top-level update pipeline.
pub mod update;
/// Per-mirror task loop.
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;
