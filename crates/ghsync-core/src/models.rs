//! Domain models for ghsync.
//!
//! These are the core types shared across all crates.

pub mod link;
pub mod permission;
pub mod resource;
pub mod user;
