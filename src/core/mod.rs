pub mod agents;
pub mod cache;
pub mod compact;
pub mod engine;
pub mod limiter;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod research;
pub mod signal;
pub mod signing;
pub mod store;
pub mod webhooks;
pub mod worker;
