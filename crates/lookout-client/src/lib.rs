pub mod config;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod session;
pub mod shutdown;
pub mod sse;

pub use config::ClientConfig;
pub use error::GatewayError;
pub use gateway::{Gateway, HttpGateway};
pub use poller::{RosterEvent, RosterPoller};
pub use session::{ConnectOutcome, SessionConfig, SessionHandle, SessionManager, StopOutcome};
pub use shutdown::{Shutdown, ShutdownListener};
pub use sse::{STREAM_END_SENTINEL, StreamConsumer, StreamEvent};
