//! Run a bridge configuration against an in-process loopback PV store.
//!
//! Every record referenced by the configuration is created locally with a
//! structure matching the declared signals. The output side writes a counter
//! into every output signal each cycle, and the input side logs what it sees.
//! Point an input channel and an output channel at the same remote name to
//! see values go round the loop.

use std::{path::PathBuf, process::ExitCode, sync::Arc, thread, time::Duration};

use clap::Parser;
use pvbridge::{
    config::{BridgeConfig, ChannelConfig, ConfigError},
    datasource::{DataSourceError, InputDataSource, OutputBroker, OutputDataSource},
    providers::{IntercomProvider, Transport},
    pvdata::{PvField, PvStructure, ScalarArray, ScalarValue},
    signal::{SignalDescriptor, qualified_name, split_root},
};
use thiserror::Error;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

#[derive(Parser)]
struct Options {
    /// Bridge configuration file
    #[clap(required = true, id = "CONFIG")]
    config: PathBuf,
    /// Number of cycles to run
    #[clap(long, default_value_t = 10)]
    cycles: u32,
    /// Cycle period in milliseconds
    #[clap(long, default_value_t = 100)]
    period: u64,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

fn main() -> ExitCode {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Create an empty record for every remote name, with a field for every signal
fn synthesize_records(config: &BridgeConfig) -> Vec<(String, PvStructure)> {
    let mut sections: Vec<(&[ChannelConfig], &[SignalDescriptor])> = Vec::new();
    if let Some(input) = &config.input {
        sections.push((input.channels.as_slice(), input.signals.as_slice()));
    }
    if let Some(output) = &config.output {
        sections.push((output.channels.as_slice(), output.signals.as_slice()));
    }

    let mut records: Vec<(String, PvStructure)> = Vec::new();
    for (channels, signals) in sections {
        for signal in signals {
            let Some((root, remainder)) = split_root(&signal.name) else {
                warn!("Skipping signal with invalid name '{}'", signal.name);
                continue;
            };
            if remainder.contains('[') {
                warn!("Not creating a field for indexed signal '{}'", signal.name);
                continue;
            }
            let channel = channels
                .iter()
                .find(|c| c.name == root)
                .cloned()
                .unwrap_or_else(|| ChannelConfig::new(root));
            let field = qualified_name(channel.field_prefix(), remainder);
            if field.is_empty() {
                warn!("Signal '{}' does not name a field", signal.name);
                continue;
            }
            let value = if signal.elements == 1 {
                PvField::Scalar(ScalarValue::default_for(signal.signal_type))
            } else {
                PvField::ScalarArray(ScalarArray::zeroed(
                    signal.signal_type,
                    signal.elements as usize,
                ))
            };

            let remote = channel.remote_name();
            let index = match records.iter().position(|(name, _)| name == remote) {
                Some(index) => index,
                None => {
                    records.push((remote.to_string(), PvStructure::new("structure")));
                    records.len() - 1
                }
            };
            if let Err(e) = records[index].1.insert_path(&field, value) {
                warn!("Could not add {field} to {remote}: {e}");
            }
        }
    }
    records
}

fn run(opts: &Options) -> Result<(), AppError> {
    let config = BridgeConfig::load(&opts.config)?;

    let mut provider = IntercomProvider::new();
    for (name, record) in synthesize_records(&config) {
        debug!("Creating {name}: {record:?}");
        if provider.add_pv(&name, record).is_err() {
            warn!("Record {name} created twice");
        }
    }
    let transport: Arc<dyn Transport> = Arc::new(provider);

    let mut input = match &config.input {
        Some(input_config) => {
            let mut ds = InputDataSource::new("Input", input_config.clone(), transport.clone());
            ds.setup_from_config()?;
            ds.start()?;
            Some(ds)
        }
        None => None,
    };
    let mut broker = match &config.output {
        Some(output_config) => {
            let mut ds = OutputDataSource::new("Output", output_config.clone(), transport.clone());
            ds.setup_from_config()?;
            Some(OutputBroker::start(ds)?)
        }
        None => None,
    };
    let output_signals = config
        .output
        .as_ref()
        .map(|o| o.signals.clone())
        .unwrap_or_default();

    let period = Duration::from_millis(opts.period);
    for cycle in 0..opts.cycles {
        if let Some(broker) = broker.as_mut() {
            let value = ScalarValue::F64(f64::from(cycle % 100));
            for signal in &output_signals {
                let Some(memory) = broker.signal_memory(&signal.name) else {
                    continue;
                };
                for index in 0..memory.elements() {
                    // String signals can't hold a number; they stay empty
                    let _ = memory.store_scalar(index, &value);
                }
            }
            if let Err(e) = broker.execute() {
                warn!("Cycle {cycle}: {e}");
            }
        }

        thread::sleep(period);

        if let Some(input) = input.as_mut() {
            input.synchronise()?;
            for signal in input.signals() {
                if let Some(memory) = input.signal_memory(&signal.name) {
                    info!("Cycle {cycle}: {} = {}", signal.name, memory.to_scalar_array());
                }
            }
        }
    }

    if let Some(broker) = broker {
        broker.stop()?;
    }
    if let Some(mut input) = input {
        input.stop()?;
    }
    Ok(())
}
