//! Data sources: the framework-facing side of the bridge
//!
//! A data source is handed a catalog of declared signals at setup, allocates
//! memory for each, and groups them into one [`Channel`] per root record.
//! [`InputDataSource`] keeps memory up to date from remote records on its own
//! worker threads; [`OutputDataSource`] pushes memory to remote records each
//! time it is synchronised, usually from the writer thread of an
//! [`OutputBroker`].

pub mod input;
pub mod output;

pub use input::InputDataSource;
pub use output::{BrokerStats, OutputBroker, OutputDataSource};

use std::sync::Arc;

use thiserror::Error;

use crate::{
    channel::{Channel, ChannelError, ChannelOptions},
    config::ChannelConfig,
    executor::PoolError,
    providers::Transport,
    signal::{ConfigurationError, SignalDescriptor, SignalMemory, split_root},
};

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("{data_source}: {} channels failed to write", .failures.len())]
    WriteFailed {
        data_source: String,
        failures: Vec<ChannelError>,
    },
    #[error("{0}: output buffer overrun")]
    Overrun(String),
    #[error(transparent)]
    Lifecycle(#[from] PoolError),
    #[error("{0}: not set up")]
    NotSetUp(String),
    #[error("{0}: not running")]
    NotRunning(String),
    #[error("{0}: already running")]
    AlreadyRunning(String),
}

/// Allocate zeroed memory for every declared signal
fn allocate(declared: &[SignalDescriptor]) -> Vec<SignalMemory> {
    declared
        .iter()
        .map(|d| SignalMemory::new(d.signal_type, d.elements as usize))
        .collect()
}

/// Find the memory of a signal by the name it was declared with
fn find_memory<'a>(
    declared: &[SignalDescriptor],
    memory: &'a [SignalMemory],
    name: &str,
) -> Option<&'a SignalMemory> {
    declared
        .iter()
        .position(|d| d.name == name)
        .and_then(|i| memory.get(i))
}

/// Create one channel per distinct root record, in order of first declaration
///
/// Roots with an entry in `configs` use it; the rest get default settings.
/// A configured channel that no signal refers to is an error.
fn build_channels(
    configs: &[ChannelConfig],
    declared: &[SignalDescriptor],
    memory: &[SignalMemory],
    transport: &Arc<dyn Transport>,
    options: &ChannelOptions,
) -> Result<Vec<Channel>, ConfigurationError> {
    let mut roots: Vec<&str> = Vec::new();
    for descriptor in declared {
        let (root, _) = split_root(&descriptor.name)
            .ok_or_else(|| ConfigurationError::InvalidSignalName(descriptor.name.clone()))?;
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    if let Some(unused) = configs.iter().find(|c| !roots.contains(&c.name.as_str())) {
        return Err(ConfigurationError::UnknownChannel(unused.name.clone()));
    }
    roots
        .into_iter()
        .map(|root| {
            let config = configs
                .iter()
                .find(|c| c.name == root)
                .cloned()
                .unwrap_or_else(|| ChannelConfig::new(root));
            Channel::from_config(&config, declared, memory, transport.clone(), options.clone())
        })
        .collect()
}
