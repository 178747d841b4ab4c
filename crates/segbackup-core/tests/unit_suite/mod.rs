//! Unit tests for segbackup-core.
//!
//! These tests focus on pure functions and data structures without I/O.
//! They run quickly and don't require a database or external services.

pub mod compression;
pub mod helpers;
pub mod resolver;
pub mod statistics;
pub mod toc;
