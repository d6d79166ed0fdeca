//! Core data models for the preservation store.
//!
//! These entities represent the logical structure of preserved artifacts,
//! their physical copies, and their audit history. They map cleanly to
//! database tables via `sqlx::FromRow` and serialize naturally as JSON
//! via `serde`.

pub mod artifact;
pub mod event;
pub mod location;
