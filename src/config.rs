//! Loading bridge configuration from TOML
//!
//! Keys follow the naming the surrounding real-time framework uses, so a
//! configuration looks like:
//!
//! ```toml
//! [Input]
//! CPUs = 0x2
//! StackSize = 1048576
//!
//! [[Input.Channels]]
//! Name = "RecordIn1"
//!
//! [[Input.Signals]]
//! Name = "RecordIn1.UnsignedIntegers.UInt32"
//! Type = "uint32"
//!
//! [Output]
//! NumberOfBuffers = 10
//! IgnoreBufferOverrun = true
//!
//! [[Output.Channels]]
//! Name = "RecordOut1"
//! Alias = "TEST::RECORDOUT2"
//!
//! [[Output.Signals]]
//! Name = "RecordOut1.Array"
//! Type = "float64"
//! NumberOfElements = 8
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    channel::ChannelOptions,
    signal::SignalDescriptor,
    utils::{DEFAULT_FIELD, get_default_stack_size},
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

fn all_cpus() -> u64 {
    u64::MAX
}

fn enabled() -> bool {
    true
}

/// Settings for a single remote record
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ChannelConfig {
    /// Root record name the signals are declared under
    pub name: String,
    /// Name of the remote PV, if different from the root record name
    #[serde(default)]
    pub alias: Option<String>,
    /// Field in the remote record the signals live under (default "value")
    #[serde(default)]
    pub field: Option<String>,
}

impl ChannelConfig {
    pub fn new(name: &str) -> Self {
        ChannelConfig {
            name: name.to_string(),
            alias: None,
            field: None,
        }
    }

    /// The name the remote PV is addressed by
    pub fn remote_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn field_prefix(&self) -> &str {
        self.field.as_deref().unwrap_or(DEFAULT_FIELD)
    }
}

/// Settings for an input (remote to local) data source
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct InputConfig {
    /// CPU affinity mask for the channel workers
    #[serde(rename = "CPUs", default = "all_cpus")]
    pub cpus: u64,
    #[serde(default = "get_default_stack_size")]
    pub stack_size: usize,
    /// Per-channel settings. Channels without an entry use the defaults.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub signals: Vec<SignalDescriptor>,
    /// Seconds to wait for an update on each monitor call
    #[serde(default)]
    pub monitor_wait: Option<f64>,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            cpus: all_cpus(),
            stack_size: get_default_stack_size(),
            channels: Vec::new(),
            signals: Vec::new(),
            monitor_wait: None,
        }
    }
}

impl InputConfig {
    pub fn channel_options(&self) -> ChannelOptions {
        let mut options = ChannelOptions::default();
        if let Some(wait) = self.monitor_wait.and_then(|s| Duration::try_from_secs_f64(s).ok()) {
            options.monitor_wait = wait;
        }
        options
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_common("Input", self.cpus, self.stack_size, &self.channels)?;
        validate_seconds("Input.MonitorWait", self.monitor_wait)
    }
}

/// Settings for an output (local to remote) data source
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct OutputConfig {
    /// Depth of the ring between the real-time thread and the writer
    pub number_of_buffers: u32,
    #[serde(rename = "CPUs", default = "all_cpus")]
    pub cpus: u64,
    #[serde(default = "get_default_stack_size")]
    pub stack_size: usize,
    /// Silently drop cycles when the writer falls behind
    #[serde(default = "enabled")]
    pub ignore_buffer_overrun: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub signals: Vec<SignalDescriptor>,
    /// Completion checks per put before giving up
    #[serde(default)]
    pub put_poll_iterations: Option<u32>,
    /// Seconds between completion checks
    #[serde(default)]
    pub put_poll_interval: Option<f64>,
}

impl OutputConfig {
    pub fn new(number_of_buffers: u32) -> Self {
        OutputConfig {
            number_of_buffers,
            cpus: all_cpus(),
            stack_size: get_default_stack_size(),
            ignore_buffer_overrun: true,
            channels: Vec::new(),
            signals: Vec::new(),
            put_poll_iterations: None,
            put_poll_interval: None,
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        let mut options = ChannelOptions::default();
        if let Some(iterations) = self.put_poll_iterations {
            options.put_poll_iterations = iterations;
        }
        if let Some(interval) = self
            .put_poll_interval
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
        {
            options.put_poll_interval = interval;
        }
        options
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_buffers == 0 {
            return Err(ConfigError::ValidationError(
                "Output.NumberOfBuffers must be at least 1".to_string(),
            ));
        }
        if self.put_poll_iterations == Some(0) {
            return Err(ConfigError::ValidationError(
                "Output.PutPollIterations must be at least 1".to_string(),
            ));
        }
        validate_common("Output", self.cpus, self.stack_size, &self.channels)?;
        validate_seconds("Output.PutPollInterval", self.put_poll_interval)
    }
}

fn validate_common(
    section: &str,
    cpus: u64,
    stack_size: usize,
    channels: &[ChannelConfig],
) -> Result<(), ConfigError> {
    if cpus == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{section}.CPUs must select at least one CPU"
        )));
    }
    if stack_size == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{section}.StackSize cannot be zero"
        )));
    }
    for (i, channel) in channels.iter().enumerate() {
        if channel.name.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{section}.Channels[{i}] has no Name"
            )));
        }
        if channels[..i].iter().any(|c| c.name == channel.name) {
            return Err(ConfigError::ValidationError(format!(
                "{section}.Channels: '{}' is configured twice",
                channel.name
            )));
        }
    }
    Ok(())
}

fn validate_seconds(key: &str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(s) if Duration::try_from_secs_f64(s).is_err() => Err(ConfigError::ValidationError(
            format!("{key} must be a non-negative number of seconds"),
        )),
        _ => Ok(()),
    }
}

/// A complete bridge configuration: any combination of one input and one output
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub input: Option<InputConfig>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::FileNotFound` if the file does not exist
    /// - `ConfigError::ParseError` if it cannot be read or is not valid TOML
    /// - `ConfigError::ValidationError` if the values are unusable
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.is_none() && self.output.is_none() {
            return Err(ConfigError::ValidationError(
                "at least one of [Input] or [Output] is required".to_string(),
            ));
        }
        if let Some(input) = &self.input {
            input.validate()?;
        }
        if let Some(output) = &self.output {
            output.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::pvdata::ScalarType;

    const EXAMPLE: &str = r#"
[Input]
CPUs = 0x2
StackSize = 1048576
MonitorWait = 0.05

[[Input.Channels]]
Name = "RecordIn1"

[[Input.Signals]]
Name = "RecordIn1.UnsignedIntegers.UInt32"
Type = "uint32"

[Output]
NumberOfBuffers = 10
IgnoreBufferOverrun = false
PutPollIterations = 5

[[Output.Channels]]
Name = "RecordOut1"
Alias = "TEST::RECORDOUT2"
Field = "value"

[[Output.Signals]]
Name = "RecordOut1.Array"
Type = "float64"
NumberOfElements = 8
"#;

    #[test]
    fn test_parse_example() {
        let config = BridgeConfig::from_toml_str(EXAMPLE).unwrap();
        let input = config.input.unwrap();
        assert_eq!(input.cpus, 2);
        assert_eq!(input.stack_size, 1048576);
        assert_eq!(input.channels, vec![ChannelConfig::new("RecordIn1")]);
        assert_eq!(
            input.signals,
            vec![SignalDescriptor::new(
                "RecordIn1.UnsignedIntegers.UInt32",
                ScalarType::U32
            )]
        );
        assert_eq!(
            input.channel_options().monitor_wait,
            Duration::from_millis(50)
        );

        let output = config.output.unwrap();
        assert_eq!(output.number_of_buffers, 10);
        assert!(!output.ignore_buffer_overrun);
        assert_eq!(output.cpus, u64::MAX);
        assert_eq!(output.channels[0].remote_name(), "TEST::RECORDOUT2");
        assert_eq!(output.signals[0].elements, 8);
        assert_eq!(output.channel_options().put_poll_iterations, 5);
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_toml_str("[Output]\nNumberOfBuffers = 1\n").unwrap();
        let output = config.output.unwrap();
        assert!(output.ignore_buffer_overrun);
        assert_eq!(output.stack_size, get_default_stack_size());
        assert!(config.input.is_none());

        let channel = ChannelConfig::new("R");
        assert_eq!(channel.remote_name(), "R");
        assert_eq!(channel.field_prefix(), "value");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            BridgeConfig::from_toml_str("[Output]\nCPUs = 1\n"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[Output]\nNumberOfBuffers = 0\n"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[Input]\nCPUs = 0\n"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[Input]\nMonitorWait = -1.0\n"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[Input]\nUnknown = 1\n"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str(""),
            Err(ConfigError::ValidationError(_))
        ));
        let twice = "[Input]\n[[Input.Channels]]\nName = \"A\"\n[[Input.Channels]]\nName = \"A\"\n";
        assert!(matches!(
            BridgeConfig::from_toml_str(twice),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert!(config.input.is_some());

        let missing = BridgeConfig::load(Path::new("/nonexistent/pvbridge.toml"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound(_))));
    }
}
