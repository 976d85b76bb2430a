//! Workspace integration tests.

pub mod backends;
