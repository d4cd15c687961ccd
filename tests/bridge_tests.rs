use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use pvbridge::{
    Transport,
    channel::{Channel, ChannelError, ChannelOptions},
    config::{ChannelConfig, InputConfig, OutputConfig},
    datasource::{DataSourceError, InputDataSource, OutputDataSource},
    providers::IntercomProvider,
    pvdata::{PvField, PvNumeric, PvStructure, ScalarType},
    signal::{SignalDescriptor, SignalMemory},
    utils::Sleeper,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

fn fast_options() -> ChannelOptions {
    ChannelOptions {
        monitor_wait: Duration::from_millis(20),
        put_poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Build a standalone channel over freshly allocated memory
fn channel(
    provider: &IntercomProvider,
    config: ChannelConfig,
    declared: &[SignalDescriptor],
) -> (Channel, Vec<SignalMemory>) {
    let memory: Vec<_> = declared
        .iter()
        .map(|d| SignalMemory::new(d.signal_type, d.elements as usize))
        .collect();
    let channel = Channel::from_config(
        &config,
        declared,
        &memory,
        Arc::new(provider.clone()),
        fast_options(),
    )
    .unwrap();
    (channel, memory)
}

/// Wait for a condition to become true, or give up after a few seconds
fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_input_data_source_follows_remote() {
    init_logging();
    let mut provider = IntercomProvider::new();
    let pv = provider
        .add_pv(
            "RecordIn1",
            PvStructure::new("").with(
                "value",
                PvStructure::new("")
                    .with("UnsignedIntegers", PvStructure::new("").with("UInt32", 3u32)),
            ),
        )
        .unwrap();

    let mut ds = InputDataSource::new("input", InputConfig::default(), Arc::new(provider.clone()))
        .with_options(fast_options());
    ds.setup(&vec![SignalDescriptor::new(
        "RecordIn1.UnsignedIntegers.UInt32",
        ScalarType::U32,
    )])
    .unwrap();
    let memory = ds
        .signal_memory("RecordIn1.UnsignedIntegers.UInt32")
        .unwrap()
        .clone();
    ds.start().unwrap();
    assert!(ds.is_running());
    assert!(eventually(|| memory.load::<u32>(0) == 3));

    pv.update(|v| {
        v.insert_path("value.UnsignedIntegers.UInt32", 7u32)
            .unwrap()
    });
    assert!(eventually(|| memory.load::<u32>(0) == 7));

    ds.stop().unwrap();
    assert!(!ds.is_running());
    assert!(ds.channels()[0].is_structure_resolved());
}

#[test]
fn test_put_to_aliased_record() {
    init_logging();
    let mut provider = IntercomProvider::new();
    provider
        .add_pv(
            "TEST::RECORDOUT2",
            PvStructure::new("").with("value", PvStructure::new("").with("Int16", 0i16)),
        )
        .unwrap();

    let config = OutputConfig {
        channels: vec![ChannelConfig {
            alias: Some("TEST::RECORDOUT2".to_string()),
            ..ChannelConfig::new("RecordOut1")
        }],
        ..OutputConfig::new(2)
    };
    let mut ds = OutputDataSource::new("output", config, Arc::new(provider.clone()))
        .with_options(fast_options());
    ds.setup(&vec![SignalDescriptor::new("RecordOut1.Int16", ScalarType::I16)])
        .unwrap();
    assert_eq!(ds.channels()[0].name(), "TEST::RECORDOUT2");
    assert_eq!(ds.channels()[0].unaliased_name(), "RecordOut1");

    ds.signal_memory("RecordOut1.Int16")
        .unwrap()
        .store(0, -1234i16);
    ds.synchronise().unwrap();

    let mut connection = provider.connect("TEST::RECORDOUT2").unwrap();
    let value = connection.get().unwrap();
    assert_eq!(value.lookup("value.Int16"), Some(&PvField::from(-1234i16)));
}

/// Put a single value into a field of the same type, and read it back with a get
fn scalar_round_trip<T>(value: T)
where
    T: PvNumeric,
    PvField: From<T>,
{
    let mut provider = IntercomProvider::new();
    let name = format!("Scalar{}", T::SCALAR_TYPE);
    provider
        .add_pv(&name, PvStructure::new("").with("value", T::default()))
        .unwrap();
    let (mut channel, memory) = channel(
        &provider,
        ChannelConfig::new(&name),
        &[SignalDescriptor::new(&name, T::SCALAR_TYPE)],
    );
    memory[0].store(0, value);
    channel.put().unwrap();

    let mut connection = provider.connect(&name).unwrap();
    let value_read = connection.get().unwrap();
    assert_eq!(value_read.field("value"), Some(&PvField::from(value)));
}

#[test]
fn test_scalar_round_trip_every_type() {
    init_logging();
    scalar_round_trip(u8::MAX);
    scalar_round_trip(i8::MIN);
    scalar_round_trip(u16::MAX - 1);
    scalar_round_trip(i16::MIN + 1);
    scalar_round_trip(u32::MAX);
    scalar_round_trip(i32::MIN);
    scalar_round_trip(u64::MAX);
    scalar_round_trip(i64::MIN);
    scalar_round_trip(0.1f32);
    scalar_round_trip(-1.234_567_890_123e300f64);
}

#[test]
fn test_array_round_trip() {
    init_logging();
    let mut provider = IntercomProvider::new();
    provider
        .add_pv(
            "Arrays",
            PvStructure::new("").with(
                "value",
                PvStructure::new("").with("Samples", vec![0.0f64; 8]),
            ),
        )
        .unwrap();
    let declared = [SignalDescriptor::new("Arrays.Samples", ScalarType::F64).elements(8)];
    let (mut writer, written) = channel(&provider, ChannelConfig::new("Arrays"), &declared);
    let (mut reader, read) = channel(&provider, ChannelConfig::new("Arrays"), &declared);

    let values: Vec<f64> = (0..8).map(|i| f64::from(i) * 1.5 - 3.0).collect();
    written[0].store_slice(&values);
    writer.put().unwrap();
    reader.monitor().unwrap();
    assert_eq!(read[0].to_vec::<f64>(), values);
}

#[test]
fn test_unmatched_signal_is_skipped_on_read_and_fails_put() {
    init_logging();
    let mut provider = IntercomProvider::new();
    provider
        .add_pv(
            "Partial",
            PvStructure::new("").with("value", PvStructure::new("").with("Present", 5i32)),
        )
        .unwrap();
    let declared = [
        SignalDescriptor::new("Partial.Present", ScalarType::I32),
        SignalDescriptor::new("Partial.Absent", ScalarType::I32),
    ];
    let (mut channel, memory) = channel(&provider, ChannelConfig::new("Partial"), &declared);
    memory[1].store(0, 99i32);

    channel.monitor().unwrap();
    assert_eq!(memory[0].load::<i32>(0), 5);
    assert_eq!(memory[1].load::<i32>(0), 99);

    match channel.put() {
        Err(ChannelError::Unresolved { signals, .. }) => {
            assert_eq!(signals, vec!["Partial.Absent"])
        }
        other => panic!("Expected put to fail, got {other:?}"),
    }
}

#[derive(Default)]
struct CountingSleeper(AtomicU32);

impl Sleeper for CountingSleeper {
    fn sleep(&self, _duration: Duration) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_unacknowledged_put_fails_the_cycle() {
    init_logging();
    let mut provider = IntercomProvider::new();
    let pv = provider
        .add_pv("Slow", PvStructure::new("").with("value", 0u16))
        .unwrap();
    pv.hold_put_acknowledgements(true);

    let sleeper = Arc::new(CountingSleeper::default());
    let options = ChannelOptions {
        sleeper: sleeper.clone(),
        ..Default::default()
    };
    let mut ds = OutputDataSource::new("output", OutputConfig::new(1), Arc::new(provider.clone()))
        .with_options(options);
    ds.setup(&vec![SignalDescriptor::new("Slow", ScalarType::U16)])
        .unwrap();

    match ds.synchronise() {
        Err(DataSourceError::WriteFailed { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(
                failures[0],
                ChannelError::Timeout { iterations: 10, .. }
            ));
        }
        other => panic!("Expected a timeout, got {other:?}"),
    }
    assert_eq!(sleeper.0.load(Ordering::SeqCst), 10);
    assert_eq!(pv.put_count(), 1);
}

#[test]
fn test_reconnect_resolves_new_structure() {
    init_logging();
    let mut provider = IntercomProvider::new();
    let pv = provider
        .add_pv(
            "Changing",
            PvStructure::new("").with("value", PvStructure::new("").with("a", 1u32)),
        )
        .unwrap();
    let (mut channel, memory) = channel(
        &provider,
        ChannelConfig::new("Changing"),
        &[SignalDescriptor::new("Changing.a", ScalarType::U32)],
    );
    channel.monitor().unwrap();
    assert_eq!(memory[0].load::<u32>(0), 1);

    // A new structure ends the subscription
    pv.store(
        PvStructure::new("").with(
            "value",
            PvStructure::new("").with("b", -1i8).with("a", 2u16),
        ),
    );
    assert!(channel.monitor().unwrap_err().is_connection());
    assert!(!channel.is_connected());

    channel.monitor().unwrap();
    assert!(channel.is_structure_resolved());
    assert_eq!(memory[0].load::<u32>(0), 2);
}

#[test]
fn test_connection_failure_then_retry() {
    init_logging();
    let mut provider = IntercomProvider::new();
    let (mut channel, memory) = channel(
        &provider,
        ChannelConfig::new("Late"),
        &[SignalDescriptor::new("Late", ScalarType::F32)],
    );
    assert!(channel.monitor().unwrap_err().is_connection());
    assert!(channel.put().unwrap_err().is_connection());

    provider
        .add_pv("Late", PvStructure::new("").with("value", 2.5f32))
        .unwrap();
    channel.monitor().unwrap();
    assert_eq!(memory[0].load::<f32>(0), 2.5);

    provider.remove_pv("Late");
    assert!(channel.monitor().unwrap_err().is_connection());
    assert!(!channel.is_connected());
}

#[test]
fn test_output_attempts_every_channel() {
    init_logging();
    let mut provider = IntercomProvider::new();
    let good = provider
        .add_pv("Good", PvStructure::new("").with("value", 0u8))
        .unwrap();
    let mut ds = OutputDataSource::new("output", OutputConfig::new(1), Arc::new(provider.clone()))
        .with_options(fast_options());
    ds.setup(&vec![
        SignalDescriptor::new("Missing", ScalarType::U8),
        SignalDescriptor::new("Good", ScalarType::U8),
    ])
    .unwrap();
    ds.signal_memory("Good").unwrap().store(0, 17u8);

    match ds.synchronise() {
        Err(DataSourceError::WriteFailed { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].is_connection());
        }
        other => panic!("Expected one failure, got {other:?}"),
    }
    assert_eq!(good.load().field("value"), Some(&PvField::from(17u8)));
}
