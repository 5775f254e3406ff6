pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod publisher;
pub mod retry;
pub mod selection;
pub mod store;
