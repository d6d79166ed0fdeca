pub mod preservation_service;
pub mod replication;
