pub mod config;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod policy;
pub mod reader;
