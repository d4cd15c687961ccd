//! One remote record, and the local signals that mirror it
//!
//! A [`Channel`] owns a lazily opened connection to a single remote PV, the
//! table of local signals that map onto its leaves, and the state for the two
//! synchronisation protocols: [`Channel::monitor`] copies remote updates into
//! signal memory, and [`Channel::put`] pushes signal memory to the remote PV.
//!
//! Both protocols are blocking and bounded, and are meant to be driven from a
//! worker thread rather than the real-time loop.

mod dispatch;
mod monitor;
mod put;
pub mod resolver;

pub use dispatch::{TransferError, read_leaf, write_leaf};

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::debug;

use crate::{
    config::ChannelConfig,
    providers::{Connection, Subscription, Transport, TransportError},
    pvdata::{PvStructure, ScalarType},
    signal::{
        CachedSignal, ConfigurationError, SignalDescriptor, SignalMemory, build_cached_signals,
    },
    utils::{
        Sleeper, ThreadSleeper, get_default_monitor_wait, get_default_put_poll_interval,
        get_default_put_poll_iterations,
    },
};

use resolver::Bindings;

/// Tuning for the blocking parts of the channel protocols
#[derive(Clone)]
pub struct ChannelOptions {
    /// How long a monitor call waits for an update
    pub monitor_wait: Duration,
    /// How many times a put checks for completion before failing
    pub put_poll_iterations: u32,
    /// Sleep between put completion checks
    pub put_poll_interval: Duration,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            monitor_wait: get_default_monitor_wait(),
            put_poll_iterations: get_default_put_poll_iterations(),
            put_poll_interval: get_default_put_poll_interval(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("monitor_wait", &self.monitor_wait)
            .field("put_poll_iterations", &self.put_poll_iterations)
            .field("put_poll_interval", &self.put_poll_interval)
            .finish_non_exhaustive()
    }
}

/// The protocol step a channel failure happened in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Subscribe,
    Wait,
    Poll,
    Get,
    Put,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::Subscribe => "subscribe",
            Operation::Wait => "wait",
            Operation::Poll => "poll",
            Operation::Get => "get",
            Operation::Put => "put",
        })
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{channel}: {operation} failed: {source}")]
    Connection {
        channel: String,
        operation: Operation,
        source: TransportError,
    },
    #[error("{channel}: signal {signal} ({signal_type}): {detail}")]
    TypeMismatch {
        channel: String,
        signal: String,
        signal_type: ScalarType,
        detail: TransferError,
    },
    #[error("{channel}: no field for signals {signals:?}")]
    Unresolved { channel: String, signals: Vec<String> },
    #[error("{channel}: put not acknowledged after {iterations} checks")]
    Timeout { channel: String, iterations: u32 },
    #[error("{channel}: put rejected: {source}")]
    PutRejected {
        channel: String,
        source: TransportError,
    },
}

impl ChannelError {
    /// Is this a transport failure, after which the connection is reset?
    pub fn is_connection(&self) -> bool {
        matches!(self, ChannelError::Connection { .. })
    }
}

/// The put value template, and where each signal lives in it
struct PutTemplate {
    value: PvStructure,
    bindings: Bindings,
}

/// Synchronises one remote record with a set of local signals
pub struct Channel {
    /// Name used to address the remote PV (the alias, if one is configured)
    name: String,
    /// Root record name the signals were declared under
    unaliased_name: String,
    field: String,
    signals: Vec<CachedSignal>,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    connection: Option<Box<dyn Connection>>,
    subscription: Option<Box<dyn Subscription>>,
    structure_resolved: bool,
    bindings: Bindings,
    put_template: Option<PutTemplate>,
}

impl Channel {
    /// Create a channel over an already-built signal table
    pub fn new(
        name: &str,
        unaliased_name: &str,
        field: &str,
        signals: Vec<CachedSignal>,
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> Self {
        Channel {
            name: name.to_string(),
            unaliased_name: unaliased_name.to_string(),
            field: field.to_string(),
            bindings: Bindings::unbound(signals.len()),
            signals,
            transport,
            options,
            connection: None,
            subscription: None,
            structure_resolved: false,
            put_template: None,
        }
    }

    /// Create a channel from its configuration, picking its signals out of all those declared
    pub fn from_config(
        config: &ChannelConfig,
        declared: &[SignalDescriptor],
        memory: &[SignalMemory],
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> Result<Self, ConfigurationError> {
        let signals = build_cached_signals(&config.name, config.field_prefix(), declared, memory)?;
        if signals.is_empty() {
            return Err(ConfigurationError::UnknownChannel(config.name.clone()));
        }
        Ok(Channel::new(
            config.remote_name(),
            &config.name,
            config.field_prefix(),
            signals,
            transport,
            options,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn unaliased_name(&self) -> &str {
        &self.unaliased_name
    }
    pub fn field(&self) -> &str {
        &self.field
    }
    pub fn signals(&self) -> &[CachedSignal] {
        &self.signals
    }
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
    pub fn is_structure_resolved(&self) -> bool {
        self.structure_resolved
    }

    /// Memory for a signal, looked up by the name it was declared with
    ///
    /// Accepts the full declared name (`Record1.NodeA.Element1`) or the part
    /// after the root record (`NodeA.Element1`).
    pub fn signal_memory(&self, declared_name: &str) -> Option<&SignalMemory> {
        let wanted = declared_name
            .strip_prefix(self.unaliased_name.as_str())
            .unwrap_or(declared_name);
        self.signals
            .iter()
            .find(|s| {
                s.declared_name()
                    .strip_prefix(self.unaliased_name.as_str())
                    .is_some_and(|remainder| {
                        remainder == wanted || remainder.strip_prefix('.') == Some(wanted)
                    })
            })
            .map(|s| s.memory())
    }

    fn connection_error(&self, operation: Operation, source: TransportError) -> ChannelError {
        ChannelError::Connection {
            channel: self.name.clone(),
            operation,
            source,
        }
    }

    /// The connection, opening it first if needed
    fn ensure_connected(&mut self) -> Result<&mut Box<dyn Connection>, ChannelError> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => {
                debug!("{}: Connecting", self.name);
                self.transport
                    .connect(&self.name)
                    .map_err(|e| self.connection_error(Operation::Connect, e))?
            }
        };
        Ok(self.connection.insert(connection))
    }

    /// Drop the connection and any subscription; the next call reconnects
    pub fn disconnect(&mut self) {
        self.subscription = None;
        self.connection = None;
        self.structure_resolved = false;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("unaliased_name", &self.unaliased_name)
            .field("field", &self.field)
            .field("signals", &self.signals.len())
            .field("connected", &self.connection.is_some())
            .field("structure_resolved", &self.structure_resolved)
            .finish()
    }
}
