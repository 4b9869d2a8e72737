//! A pure Rust iSCSI initiator receive engine
//!
//! This library implements the receive side of an iSCSI initiator: it
//! turns the byte stream of one target connection into validated, ordered
//! PDUs, correlates each with the in-flight request that caused it,
//! enforces the session's sequencing and recovery rules, and completes the
//! corresponding request objects.
//!
//! The transmit path, login negotiation content and SCSI command
//! construction live outside this crate; they plug in through the
//! [`SendPath`], [`NegotiationEngine`] and [`SessionLifecycle`] traits.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{
//!     Connection, RecvConfig, RecvEngine, Session, TcpTransport,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! # fn collaborators() -> (
//! #     Arc<dyn iscsi_initiator::SendPath>,
//! #     Arc<dyn iscsi_initiator::NegotiationEngine>,
//! #     Arc<dyn iscsi_initiator::SessionLifecycle>,
//! # ) { unimplemented!() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RecvConfig::default();
//! // Session state as negotiated at login: ExpCmdSN, MaxCmdSN, ERL
//! let session = Arc::new(Session::new(1, 32, 1, config.clone()));
//! // Connection 0, first StatSN expected from the target
//! let conn = Arc::new(Mutex::new(Connection::new(0, 1, &config)));
//!
//! let transport = TcpTransport::connect(
//!     "192.168.1.100:3260",
//!     config.idle_timeout,
//!     config.data_timeout,
//! )?;
//!
//! let (send, negotiation, lifecycle) = collaborators();
//! let mut engine = RecvEngine::new(transport, session, conn, send, negotiation, lifecycle);
//! // One dedicated thread per connection; blocks until teardown
//! engine.run()?;
//! # Ok(())
//! # }
//! ```

pub mod ccb;
pub mod digest;
pub mod error;
pub mod pdu;
pub mod recv;
pub mod sequence;
pub mod session;
pub mod transport;

pub use ccb::{Ccb, CcbArena, CcbKind, CmdStatus, Disposition as CcbDisposition, TaskTag};
pub use error::{IscsiError, IscsiResult};
pub use recv::{
    Disposition, NegotiationEngine, NegotiationOutcome, Pdu, RecvEngine, SendPath,
    SessionLifecycle, SnackKind,
};
pub use sequence::{SequenceWindow, SnOutcome};
pub use session::{ConnState, Connection, RecvConfig, Session};
pub use transport::{ReadWait, TcpCancelHandle, TcpTransport, Transport};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
