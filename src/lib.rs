//! Preservation store core library.
//!
//! Ingests arbitrarily large byte streams with inline fixity computation,
//! commits them atomically to a hot storage tier, replicates verified
//! artifacts to an archive tier with retry and independent re-verification,
//! and keeps an append-only, causally ordered preservation event log.

pub mod config;
pub mod digest;
pub mod errors;
pub mod fixity;
pub mod handlers;
pub mod models;
pub mod repo;
pub mod routes;
pub mod services;
pub mod storage;
