pub mod agent;
pub mod liveness;
pub mod metrics;
pub mod session;
pub mod time;
pub mod transcript;
