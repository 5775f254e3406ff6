pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod observability;
pub mod orchestrator;
pub mod scoring;
pub mod selector;
pub mod worker;
pub mod writer;
