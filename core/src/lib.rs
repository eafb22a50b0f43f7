pub mod cadence;
pub mod classify;
pub mod compose;
pub mod config;
pub mod conversation;
pub mod error;
pub mod intake;
pub mod legacy;
pub mod llm;
pub mod metadata;
pub mod orchestrator;
pub mod plan;
pub mod resources;
pub mod safety;
