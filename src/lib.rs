pub mod app;
pub mod broadcast;
pub mod config;
pub mod delivery;
pub mod error;
pub mod generator;
pub mod handoff;
pub mod ingest;
pub mod prompting;
pub mod store;
pub mod types;
pub mod webhook;
