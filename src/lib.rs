pub mod config;
pub mod contracts;
pub mod email;
pub mod messaging;
pub mod metrics;
