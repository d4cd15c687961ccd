use std::sync::Arc;

use tracing::{info, trace};

use crate::{
    channel::{Channel, ChannelOptions},
    config::InputConfig,
    datasource::{DataSourceError, allocate, build_channels, find_memory},
    executor::{Worker, WorkerPool, WorkerSettings},
    providers::Transport,
    signal::{ConfigurationError, SignalCatalog, SignalDescriptor, SignalMemory, read_catalog},
    utils::{Sleeper, get_default_stop_timeout},
};

/// Runs the monitor protocol of a single channel, forever
pub struct MonitorWorker {
    channel: Channel,
    sleeper: Arc<dyn Sleeper>,
    retry_interval: std::time::Duration,
}

impl Worker for MonitorWorker {
    fn execute(&mut self) {
        if let Err(e) = self.channel.monitor()
            && e.is_connection()
        {
            // Don't spin on a record that can't be reached
            self.sleeper.sleep(self.retry_interval);
        }
    }
}

/// Keeps signal memory up to date with remote records
///
/// Each channel is monitored on a dedicated worker thread once the data
/// source is started. Nothing happens on the real-time side:
/// [`InputDataSource::synchronise`] does not block or copy.
pub struct InputDataSource {
    name: String,
    config: InputConfig,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    declared: Vec<SignalDescriptor>,
    memory: Vec<SignalMemory>,
    channels: Vec<Channel>,
    channel_names: Vec<String>,
    pool: Option<WorkerPool<MonitorWorker>>,
}

impl InputDataSource {
    pub fn new(name: &str, config: InputConfig, transport: Arc<dyn Transport>) -> Self {
        InputDataSource {
            name: name.to_string(),
            options: config.channel_options(),
            config,
            transport,
            declared: Vec::new(),
            memory: Vec::new(),
            channels: Vec::new(),
            channel_names: Vec::new(),
            pool: None,
        }
    }

    /// Replace the channel options derived from the configuration
    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate memory for every declared signal, and create the channels
    pub fn setup(&mut self, catalog: &dyn SignalCatalog) -> Result<(), DataSourceError> {
        if self.pool.is_some() {
            return Err(DataSourceError::AlreadyRunning(self.name.clone()));
        }
        let declared = read_catalog(catalog)?;
        if declared.is_empty() {
            return Err(ConfigurationError::NoSignals.into());
        }
        if let Some(d) = declared.iter().find(|d| d.samples > 1) {
            return Err(ConfigurationError::Parameters {
                signal: d.name.clone(),
                detail: format!(
                    "{} samples requested, at most 1 can be read per cycle",
                    d.samples
                ),
            }
            .into());
        }
        let memory = allocate(&declared);
        let channels = build_channels(
            &self.config.channels,
            &declared,
            &memory,
            &self.transport,
            &self.options,
        )?;
        info!(
            "{}: {} signals over {} channels",
            self.name,
            declared.len(),
            channels.len()
        );
        self.channel_names = channels.iter().map(|c| c.name().to_string()).collect();
        self.declared = declared;
        self.memory = memory;
        self.channels = channels;
        Ok(())
    }

    /// Set up using the signals listed in the configuration
    pub fn setup_from_config(&mut self) -> Result<(), DataSourceError> {
        let signals = self.config.signals.clone();
        self.setup(&signals)
    }

    /// Memory of a declared signal, e.g. `RecordIn1.UnsignedIntegers.UInt32`
    pub fn signal_memory(&self, name: &str) -> Option<&SignalMemory> {
        find_memory(&self.declared, &self.memory, name)
    }

    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.declared
    }

    /// Remote names of all channels, whether or not they are running
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// The channels, while they are not running
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_some()
    }

    /// Start one monitor worker per channel
    pub fn start(&mut self) -> Result<(), DataSourceError> {
        if self.pool.is_some() {
            return Err(DataSourceError::AlreadyRunning(self.name.clone()));
        }
        if self.channels.is_empty() {
            return Err(DataSourceError::NotSetUp(self.name.clone()));
        }
        let workers = self
            .channels
            .drain(..)
            .map(|channel| MonitorWorker {
                channel,
                sleeper: self.options.sleeper.clone(),
                retry_interval: self.options.monitor_wait,
            })
            .collect();
        let settings = WorkerSettings {
            cpus: self.config.cpus,
            stack_size: self.config.stack_size,
            // A worker may be waiting for an update, then sleeping before a retry
            stop_timeout: self
                .options
                .monitor_wait
                .saturating_mul(2)
                .saturating_add(get_default_stop_timeout()),
            ..WorkerSettings::new(&format!("{}-in", self.name))
        };
        self.pool = Some(WorkerPool::start(&settings, workers)?);
        info!("{}: Started {} monitor workers", self.name, self.channel_names.len());
        Ok(())
    }

    /// Nothing to do: memory is written by the workers as updates arrive
    pub fn synchronise(&mut self) -> Result<(), DataSourceError> {
        trace!("{}: synchronise", self.name);
        Ok(())
    }

    /// Stop the workers and take back their channels
    ///
    /// Stopping a data source that is not running does nothing.
    pub fn stop(&mut self) -> Result<(), DataSourceError> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };
        let workers = pool.stop()?;
        self.channels = workers.into_iter().map(|w| w.channel).collect();
        info!("{}: Stopped", self.name);
        Ok(())
    }
}

impl Drop for InputDataSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("{}: Failed to stop cleanly: {e}", self.name);
        }
    }
}
