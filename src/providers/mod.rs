//! Interface between the bridge and a PV transport
//!
//! The bridge never speaks a wire protocol itself. Everything it needs from
//! the remote PV store is expressed by the three traits here: a [`Transport`]
//! hands out one [`Connection`] per record, and a connection can fetch a
//! snapshot, write a value back, or open a [`Subscription`] to changes.

pub mod intercom;
pub use intercom::{Intercom, IntercomProvider};

use std::time::Duration;

use thiserror::Error;

use crate::pvdata::PvStructure;

/// Failure reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no such PV: {0}")]
    NotFound(String),
    #[error("disconnected from PV")]
    Disconnected,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

/// Why a monitor event was delivered
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Data,
    Disconnected,
    Cancelled,
}

/// A single notification from a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    pub kind: EventKind,
    /// The complete value of the record. Present on [`EventKind::Data`].
    pub root: Option<PvStructure>,
}

impl MonitorEvent {
    pub fn data(root: PvStructure) -> Self {
        MonitorEvent {
            kind: EventKind::Data,
            root: Some(root),
        }
    }
    pub fn signal(kind: EventKind) -> Self {
        MonitorEvent { kind, root: None }
    }
}

/// Called exactly once when a put has been processed by the remote end
pub type PutCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Opens connections to named PVs
pub trait Transport: Send + Sync {
    fn connect(&self, pv_name: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// A connection to a single PV
pub trait Connection: Send {
    /// Blocking fetch of the current value
    fn get(&mut self) -> Result<PvStructure, TransportError>;

    /// Start receiving change notifications
    fn monitor(&mut self) -> Result<Box<dyn Subscription>, TransportError>;

    /// Send a new value. Completion is reported through `done`, which may be
    /// called before this returns, later from another thread, or never.
    fn put(&mut self, value: &PvStructure, done: PutCallback) -> Result<(), TransportError>;
}

/// A stream of [`MonitorEvent`] for one PV
pub trait Subscription: Send {
    /// Block for at most `timeout` until an event is pending. Returns whether one is.
    fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Take the next pending event, without blocking
    fn poll(&mut self) -> Result<Option<MonitorEvent>, TransportError>;
}
