//! Quiver server library.
//!
//! This crate provides the session side of the Quiver graph database
//! server: the protocol state machine, the per-connection session loop,
//! response dispatch, the statement processor interface, and the TCP
//! transport that ties them together.

pub mod config;
pub mod echo;
pub mod error;
pub mod handler;
pub mod interrupt;
pub mod machine;
pub mod processor;
pub mod session;
pub mod status;
pub mod transport;

pub use config::{Args, ServerConfig};
pub use echo::EchoFactory;
pub use error::Error;
pub use handler::{RecordSink, ResponseCollector};
pub use interrupt::InterruptSignal;
pub use machine::{MachineContext, State, StateMachine};
pub use processor::{
    Bookmark, ProcessorError, ProcessorFactory, RecordConsumer, StatementMetadata,
    StatementProcessor,
};
pub use session::Session;
pub use status::{Failure, Fatality};
pub use transport::{ConnectionHandle, ServerMetrics, Transport};
