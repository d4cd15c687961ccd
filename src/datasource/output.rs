use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{Channel, ChannelOptions},
    config::OutputConfig,
    datasource::{DataSourceError, allocate, build_channels, find_memory},
    executor::{Worker, WorkerPool, WorkerSettings},
    providers::Transport,
    signal::{ConfigurationError, SignalCatalog, SignalDescriptor, SignalMemory, read_catalog},
    utils::get_default_stop_timeout,
};

/// How long the writer waits for a cycle before checking whether it should stop
const WRITER_WAIT: Duration = Duration::from_millis(50);

/// How long the writer may take to notice a stop request
///
/// One cycle puts every channel, and each put may poll for completion for its
/// full bound before giving up.
fn writer_stop_timeout(options: &ChannelOptions, channels: usize) -> Duration {
    let checks = options.put_poll_iterations.saturating_add(1);
    let channels = u32::try_from(channels).unwrap_or(u32::MAX);
    options
        .put_poll_interval
        .saturating_mul(checks)
        .saturating_mul(channels)
        .saturating_add(WRITER_WAIT)
        .saturating_add(get_default_stop_timeout())
}

/// Writes signal memory to remote records
///
/// Every call to [`OutputDataSource::synchronise`] puts each channel in turn
/// and waits for it to be acknowledged. This blocks, so in a real-time
/// application it is driven through an [`OutputBroker`].
pub struct OutputDataSource {
    name: String,
    config: OutputConfig,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    declared: Vec<SignalDescriptor>,
    memory: Vec<SignalMemory>,
    channels: Vec<Channel>,
}

impl OutputDataSource {
    pub fn new(name: &str, config: OutputConfig, transport: Arc<dyn Transport>) -> Self {
        OutputDataSource {
            name: name.to_string(),
            options: config.channel_options(),
            config,
            transport,
            declared: Vec::new(),
            memory: Vec::new(),
            channels: Vec::new(),
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

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Allocate memory for every declared signal, and create the channels
    pub fn setup(&mut self, catalog: &dyn SignalCatalog) -> Result<(), DataSourceError> {
        let declared = read_catalog(catalog)?;
        if declared.is_empty() {
            return Err(ConfigurationError::NoSignals.into());
        }
        for d in &declared {
            if d.samples != 1 {
                return Err(ConfigurationError::Parameters {
                    signal: d.name.clone(),
                    detail: format!(
                        "{} samples requested, exactly 1 is written per cycle",
                        d.samples
                    ),
                }
                .into());
            }
            if d.producers != 1 {
                return Err(ConfigurationError::Parameters {
                    signal: d.name.clone(),
                    detail: format!("{} producers, exactly 1 is allowed", d.producers),
                }
                .into());
            }
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

    /// Memory of a declared signal, e.g. `RecordOut1.Array`
    pub fn signal_memory(&self, name: &str) -> Option<&SignalMemory> {
        find_memory(&self.declared, &self.memory, name)
    }

    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.declared
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Put every channel, in order
    ///
    /// All channels are attempted even if some fail; the failures are
    /// reported together.
    pub fn synchronise(&mut self) -> Result<(), DataSourceError> {
        if self.channels.is_empty() {
            return Err(DataSourceError::NotSetUp(self.name.clone()));
        }
        let failures: Vec<_> = self
            .channels
            .iter_mut()
            .filter_map(|c| c.put().err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DataSourceError::WriteFailed {
                data_source: self.name.clone(),
                failures,
            })
        }
    }
}

/// Counts of what happened to the cycles handed to an [`OutputBroker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Cycles written to every channel
    pub written: u64,
    /// Cycles dropped because every buffer was in use
    pub dropped: u64,
    /// Cycles where at least one channel failed to write
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Writes snapshots to the data source, on the broker's own thread
pub struct WriterWorker {
    data_source: OutputDataSource,
    ready: Receiver<Vec<u64>>,
    free: Sender<Vec<u64>>,
    counters: Arc<Counters>,
}

impl WriterWorker {
    fn write(&mut self, snapshot: Vec<u64>) {
        let mut offset = 0;
        for memory in &self.data_source.memory {
            let end = offset + memory.elements();
            memory.restore(&snapshot[offset..end]);
            offset = end;
        }
        match self.data_source.synchronise() {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("{e}");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Only fails if the broker has gone, in which case nobody needs the buffer
        let _ = self.free.send(snapshot);
    }

    /// Write everything still queued
    fn flush(&mut self) {
        while let Ok(snapshot) = self.ready.try_recv() {
            self.write(snapshot);
        }
    }
}

impl Worker for WriterWorker {
    fn execute(&mut self) {
        match self.ready.recv_timeout(WRITER_WAIT) {
            Ok(snapshot) => self.write(snapshot),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(WRITER_WAIT),
        }
    }
}

/// Decouples a real-time loop from a blocking [`OutputDataSource`]
///
/// The real-time side writes into the broker's own copy of signal memory and
/// calls [`OutputBroker::execute`] once per cycle. That copies memory into
/// one of `NumberOfBuffers` preallocated snapshots and queues it for a single
/// writer thread, which restores it into the data source and synchronises.
/// If every snapshot is still queued the cycle is dropped: silently if
/// `IgnoreBufferOverrun` is set, and as an error otherwise.
pub struct OutputBroker {
    name: String,
    declared: Vec<SignalDescriptor>,
    memory: Vec<SignalMemory>,
    free: Receiver<Vec<u64>>,
    ready: Sender<Vec<u64>>,
    ignore_overrun: bool,
    counters: Arc<Counters>,
    pool: Option<WorkerPool<WriterWorker>>,
}

impl OutputBroker {
    /// Take ownership of a set up data source and start its writer thread
    pub fn start(data_source: OutputDataSource) -> Result<Self, DataSourceError> {
        if data_source.channels.is_empty() {
            return Err(DataSourceError::NotSetUp(data_source.name.clone()));
        }
        let name = data_source.name.clone();
        let config = data_source.config.clone();
        let declared = data_source.declared.clone();
        let memory = allocate(&declared);
        let slots: usize = memory.iter().map(|m| m.elements()).sum();

        let buffers = config.number_of_buffers.max(1) as usize;
        let (free_tx, free) = crossbeam_channel::bounded(buffers);
        let (ready, ready_rx) = crossbeam_channel::bounded(buffers);
        for _ in 0..buffers {
            let _ = free_tx.send(Vec::with_capacity(slots));
        }

        let stop_timeout = writer_stop_timeout(&data_source.options, data_source.channels.len());
        let counters = Arc::new(Counters::default());
        let writer = WriterWorker {
            data_source,
            ready: ready_rx,
            free: free_tx,
            counters: counters.clone(),
        };
        let settings = WorkerSettings {
            cpus: config.cpus,
            stack_size: config.stack_size,
            stop_timeout,
            ..WorkerSettings::new(&format!("{name}-out"))
        };
        let pool = WorkerPool::start(&settings, vec![writer])?;
        info!("{name}: Started writer with {buffers} buffers");
        Ok(OutputBroker {
            name,
            declared,
            memory,
            free,
            ready,
            ignore_overrun: config.ignore_buffer_overrun,
            counters,
            pool: Some(pool),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer-side memory of a declared signal
    pub fn signal_memory(&self, name: &str) -> Option<&SignalMemory> {
        find_memory(&self.declared, &self.memory, name)
    }

    /// Queue the current contents of memory for writing. Never blocks.
    pub fn execute(&mut self) -> Result<(), DataSourceError> {
        let mut snapshot = match self.free.try_recv() {
            Ok(snapshot) => snapshot,
            Err(TryRecvError::Disconnected) => {
                return Err(DataSourceError::NotRunning(self.name.clone()));
            }
            Err(TryRecvError::Empty) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if self.ignore_overrun {
                    trace!("{}: Buffer overrun, dropping cycle", self.name);
                    return Ok(());
                }
                warn!("{}: Buffer overrun", self.name);
                return Err(DataSourceError::Overrun(self.name.clone()));
            }
        };
        snapshot.clear();
        for memory in &self.memory {
            memory.snapshot_into(&mut snapshot);
        }
        match self.ready.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(DataSourceError::NotRunning(self.name.clone()))
            }
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer, write any cycles still queued, and hand back the data source
    pub fn stop(mut self) -> Result<OutputDataSource, DataSourceError> {
        let pool = self
            .pool
            .take()
            .ok_or_else(|| DataSourceError::NotRunning(self.name.clone()))?;
        let mut writer = pool
            .stop()?
            .pop()
            .ok_or_else(|| DataSourceError::NotRunning(self.name.clone()))?;
        writer.flush();
        info!("{}: Stopped, {:?}", self.name, self.stats());
        Ok(writer.data_source)
    }
}

impl Drop for OutputBroker {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take()
            && let Err(e) = pool.stop()
        {
            tracing::error!("{}: Failed to stop cleanly: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        providers::IntercomProvider,
        pvdata::{PvStructure, ScalarType},
    };

    fn setup(provider: &IntercomProvider, config: OutputConfig) -> OutputDataSource {
        let mut ds = OutputDataSource::new("output", config, Arc::new(provider.clone()));
        ds.setup(&vec![SignalDescriptor::new("R", ScalarType::U32)])
            .unwrap();
        ds
    }

    #[test]
    fn setup_rejects_multiple_samples_and_producers() {
        let provider = IntercomProvider::new();
        let mut ds = OutputDataSource::new("output", OutputConfig::new(1), Arc::new(provider));
        assert!(
            ds.setup(&vec![SignalDescriptor::new("R", ScalarType::U8).samples(2)])
                .is_err()
        );
        assert!(
            ds.setup(&vec![SignalDescriptor::new("R", ScalarType::U8).producers(2)])
                .is_err()
        );
        assert!(matches!(
            ds.synchronise(),
            Err(DataSourceError::NotSetUp(_))
        ));
    }

    #[test]
    fn broker_writes_cycles() {
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 0u32))
            .unwrap();
        let mut broker = OutputBroker::start(setup(&provider, OutputConfig::new(4))).unwrap();
        let memory = broker.signal_memory("R").unwrap().clone();
        memory.store(0, 42u32);
        broker.execute().unwrap();

        let ds = broker.stop().unwrap();
        assert_eq!(pv.load(), PvStructure::new("").with("value", 42u32));
        assert_eq!(ds.signal_memory("R").unwrap().load::<u32>(0), 42);
    }

    #[test]
    fn broker_overrun() {
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 0u32))
            .unwrap();
        // The writer blocks on the first put until acknowledgements resume
        pv.hold_put_acknowledgements(true);
        let config = OutputConfig {
            ignore_buffer_overrun: false,
            put_poll_iterations: Some(1000),
            ..OutputConfig::new(1)
        };
        let mut broker = OutputBroker::start(setup(&provider, config)).unwrap();
        broker.execute().unwrap();
        // Wait for the writer to pick up the only buffer and block on it
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pv.put_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            broker.execute(),
            Err(DataSourceError::Overrun(_))
        ));
        assert_eq!(broker.stats().dropped, 1);
        pv.hold_put_acknowledgements(false);
        broker.stop().unwrap();
    }

    /// Start a broker whose writer blocks on its first put, and wait until it does
    fn blocked_broker(provider: &mut IntercomProvider, config: OutputConfig) -> OutputBroker {
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 0u32))
            .unwrap();
        pv.hold_put_acknowledgements(true);
        let mut broker = OutputBroker::start(setup(provider, config)).unwrap();
        broker.execute().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pv.put_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pv.put_count(), 1);
        broker
    }

    #[test]
    fn broker_overrun_ignored() {
        let mut provider = IntercomProvider::new();
        let config = OutputConfig {
            ignore_buffer_overrun: true,
            put_poll_iterations: Some(1000),
            ..OutputConfig::new(1)
        };
        let mut broker = blocked_broker(&mut provider, config);
        assert!(broker.execute().is_ok());
        assert_eq!(broker.stats().dropped, 1);
        if let Some(pv) = provider.pv("R") {
            pv.hold_put_acknowledgements(false);
        }
        broker.stop().unwrap();
    }

    #[test]
    fn writer_stop_timeout_covers_every_put() {
        let options = ChannelOptions {
            put_poll_iterations: 50,
            put_poll_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let bound = Duration::from_millis(100) * 50 * 3;
        let timeout = writer_stop_timeout(&options, 3);
        assert!(timeout > bound);
        assert!(timeout >= bound + get_default_stop_timeout());

        let huge = ChannelOptions {
            put_poll_iterations: u32::MAX,
            put_poll_interval: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(writer_stop_timeout(&huge, 1), Duration::MAX);
    }

    #[test]
    fn broker_stops_while_a_slow_put_is_pending() {
        let mut provider = IntercomProvider::new();
        // Each put may wait 5 s for its acknowledgement, longer than the base stop timeout
        let config = OutputConfig {
            put_poll_iterations: Some(250),
            put_poll_interval: Some(0.02),
            ..OutputConfig::new(2)
        };
        let broker = blocked_broker(&mut provider, config);
        let ds = broker.stop().unwrap();
        assert_eq!(ds.channels().len(), 1);
    }

    #[test]
    fn broker_without_writer_is_not_running() {
        let (free_tx, free) = crossbeam_channel::bounded(1);
        let (ready, _ready_rx) = crossbeam_channel::bounded(1);
        drop(free_tx);
        let mut broker = OutputBroker {
            name: "output".to_string(),
            declared: Vec::new(),
            memory: Vec::new(),
            free,
            ready,
            ignore_overrun: true,
            counters: Arc::new(Counters::default()),
            pool: None,
        };
        assert!(matches!(
            broker.execute(),
            Err(DataSourceError::NotRunning(_))
        ));
        assert_eq!(broker.stats().dropped, 0);
    }
}
