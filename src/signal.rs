//! Local signals, their memory, and the per-channel signal tables
//!
//! A data source declares a flat list of signals. Each one has a name like
//! `Record1.NodeA.Element1` or `Record2.Array[3]`, where the first token
//! names the remote record (the *root*) and the remainder addresses a leaf
//! inside it. Setup groups the declared signals by root and rewrites each
//! remainder onto the channel's field prefix, so that `Record1.NodeA.Element1`
//! becomes `value.NodeA.Element1` in the table for channel `Record1`.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Deserialize;
use thiserror::Error;

use crate::pvdata::{PvNumeric, ScalarArray, ScalarType, ScalarValue, with_numeric_type};

/// Failed to turn the declared signals into a usable channel layout
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("could not read signal {index} from the catalog: {reason}")]
    Catalog { index: usize, reason: String },
    #[error("invalid signal name '{0}': must begin with a record name")]
    InvalidSignalName(String),
    #[error("signal '{0}' has no elements")]
    NoElements(String),
    #[error("signals map more than once onto field '{0}'")]
    DuplicateField(String),
    #[error("no signals declared")]
    NoSignals,
    #[error("channel '{0}' is configured but no signal refers to it")]
    UnknownChannel(String),
    #[error("signal '{signal}': {detail}")]
    Parameters { signal: String, detail: String },
}

fn one() -> u32 {
    1
}

/// Everything a data source declares about one signal
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(rename = "Type")]
    pub signal_type: ScalarType,
    #[serde(rename = "NumberOfElements", default = "one")]
    pub elements: u32,
    #[serde(default = "one")]
    pub samples: u32,
    #[serde(default = "one")]
    pub producers: u32,
    #[serde(default = "one")]
    pub consumers: u32,
}

impl SignalDescriptor {
    pub fn new(name: &str, signal_type: ScalarType) -> Self {
        SignalDescriptor {
            name: name.to_string(),
            signal_type,
            elements: 1,
            samples: 1,
            producers: 1,
            consumers: 1,
        }
    }
    pub fn elements(mut self, elements: u32) -> Self {
        self.elements = elements;
        self
    }
    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }
    pub fn producers(mut self, producers: u32) -> Self {
        self.producers = producers;
        self
    }
    pub fn consumers(mut self, consumers: u32) -> Self {
        self.consumers = consumers;
        self
    }
}

/// Failed to read a single entry from a [`SignalCatalog`]
#[derive(Debug, Clone, Error)]
#[error("signal {index}: {reason}")]
pub struct CatalogError {
    pub index: usize,
    pub reason: String,
}

/// Source of signal declarations handed to a data source at setup
pub trait SignalCatalog {
    fn number_of_signals(&self) -> usize;
    fn signal(&self, index: usize) -> Result<SignalDescriptor, CatalogError>;
}

impl SignalCatalog for [SignalDescriptor] {
    fn number_of_signals(&self) -> usize {
        self.len()
    }
    fn signal(&self, index: usize) -> Result<SignalDescriptor, CatalogError> {
        self.get(index).cloned().ok_or(CatalogError {
            index,
            reason: "index out of range".to_string(),
        })
    }
}

impl SignalCatalog for Vec<SignalDescriptor> {
    fn number_of_signals(&self) -> usize {
        self.len()
    }
    fn signal(&self, index: usize) -> Result<SignalDescriptor, CatalogError> {
        self.as_slice().signal(index)
    }
}

/// Read every declaration out of a catalog, in order
pub fn read_catalog(
    catalog: &dyn SignalCatalog,
) -> Result<Vec<SignalDescriptor>, ConfigurationError> {
    (0..catalog.number_of_signals())
        .map(|index| {
            catalog
                .signal(index)
                .map_err(|e| ConfigurationError::Catalog {
                    index: e.index,
                    reason: e.reason,
                })
        })
        .collect()
}

/// Memory backing a single signal
///
/// Every element occupies one 64-bit atomic slot, so the one writer and any
/// readers of a signal never observe a torn element. Handles are cheap to clone
/// and all refer to the same storage.
#[derive(Clone, Debug)]
pub struct SignalMemory {
    signal_type: ScalarType,
    slots: Arc<[AtomicU64]>,
}

impl SignalMemory {
    pub fn new(signal_type: ScalarType, elements: usize) -> Self {
        SignalMemory {
            signal_type,
            slots: (0..elements).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn signal_type(&self) -> ScalarType {
        self.signal_type
    }
    pub fn elements(&self) -> usize {
        self.slots.len()
    }

    /// Read one element
    ///
    /// # Panics
    /// If `index` is past the end of the signal.
    pub fn load<T: PvNumeric>(&self, index: usize) -> T {
        debug_assert_eq!(T::SCALAR_TYPE, self.signal_type);
        T::from_raw(self.slots[index].load(Ordering::Acquire))
    }

    /// Write one element
    ///
    /// # Panics
    /// If `index` is past the end of the signal.
    pub fn store<T: PvNumeric>(&self, index: usize, value: T) {
        debug_assert_eq!(T::SCALAR_TYPE, self.signal_type);
        self.slots[index].store(value.to_raw(), Ordering::Release);
    }

    /// Read up to `out.len()` elements from the start of the signal
    pub fn load_slice<T: PvNumeric>(&self, out: &mut [T]) -> usize {
        debug_assert_eq!(T::SCALAR_TYPE, self.signal_type);
        for (value, slot) in out.iter_mut().zip(self.slots.iter()) {
            *value = T::from_raw(slot.load(Ordering::Acquire));
        }
        out.len().min(self.slots.len())
    }

    /// Write up to `elements` values from the start of the signal
    pub fn store_slice<T: PvNumeric>(&self, values: &[T]) -> usize {
        debug_assert_eq!(T::SCALAR_TYPE, self.signal_type);
        for (value, slot) in values.iter().zip(self.slots.iter()) {
            slot.store(value.to_raw(), Ordering::Release);
        }
        values.len().min(self.slots.len())
    }

    pub fn to_vec<T: PvNumeric>(&self) -> Vec<T> {
        let mut out = vec![T::default(); self.elements()];
        self.load_slice(&mut out);
        out
    }

    /// Append the raw contents of every slot to `out`
    pub fn snapshot_into(&self, out: &mut Vec<u64>) {
        out.extend(self.slots.iter().map(|s| s.load(Ordering::Acquire)));
    }

    /// Overwrite every slot from raw contents previously taken by [`Self::snapshot_into`]
    pub fn restore(&self, raw: &[u64]) {
        for (slot, value) in self.slots.iter().zip(raw) {
            slot.store(*value, Ordering::Release);
        }
    }

    /// The current contents as an owned array value
    pub fn to_scalar_array(&self) -> ScalarArray {
        with_numeric_type!(self.signal_type, T => ScalarArray::from(self.to_vec::<T>()),
            ScalarArray::zeroed(ScalarType::String, self.elements()))
    }

    /// Convert a scalar into the signal's type and store it at `index`
    pub fn store_scalar(
        &self,
        index: usize,
        value: &ScalarValue,
    ) -> Result<(), crate::pvdata::ConvertError> {
        with_numeric_type!(self.signal_type, T => {
            self.store::<T>(index, value.to()?);
            Ok(())
        }, Err(crate::pvdata::ConvertError {
            from: value.scalar_type(),
            to: ScalarType::String,
        }))
    }
}

/// One declared signal, as seen from the channel it belongs to
#[derive(Clone, Debug)]
pub struct CachedSignal {
    qualified_name: String,
    declared_name: String,
    signal_type: ScalarType,
    elements: u32,
    memory: SignalMemory,
}

impl CachedSignal {
    pub fn new(qualified_name: &str, declared_name: &str, memory: SignalMemory) -> Self {
        CachedSignal {
            qualified_name: qualified_name.to_string(),
            declared_name: declared_name.to_string(),
            signal_type: memory.signal_type(),
            elements: memory.elements() as u32,
            memory,
        }
    }
    /// Name of the leaf inside the remote record, e.g. `value.NodeA.Element1`
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }
    /// Name the signal was declared with, e.g. `Record1.NodeA.Element1`
    pub fn declared_name(&self) -> &str {
        &self.declared_name
    }
    pub fn signal_type(&self) -> ScalarType {
        self.signal_type
    }
    pub fn elements(&self) -> u32 {
        self.elements
    }
    pub fn memory(&self) -> &SignalMemory {
        &self.memory
    }
}

/// Split a declared signal name into its root record and the remainder
///
/// The remainder keeps its leading separator. Returns `None` for names that
/// do not start with a record name, or that end in a dangling `.`.
pub fn split_root(name: &str) -> Option<(&str, &str)> {
    let split = name.find(['.', '[']).unwrap_or(name.len());
    let (root, remainder) = name.split_at(split);
    if root.is_empty() || remainder == "." {
        return None;
    }
    Some((root, remainder))
}

/// Append a name remainder (as returned by [`split_root`]) to a field prefix
pub fn qualified_name(prefix: &str, remainder: &str) -> String {
    if prefix.is_empty() {
        remainder.strip_prefix('.').unwrap_or(remainder).to_string()
    } else {
        format!("{prefix}{remainder}")
    }
}

/// Build the ordered signal table for the channel of one root record
///
/// `declared` and `memory` are parallel: `memory[i]` backs `declared[i]`.
pub fn build_cached_signals(
    root: &str,
    field_prefix: &str,
    declared: &[SignalDescriptor],
    memory: &[SignalMemory],
) -> Result<Vec<CachedSignal>, ConfigurationError> {
    let mut signals: Vec<CachedSignal> = Vec::new();
    for (descriptor, memory) in declared.iter().zip(memory) {
        let (signal_root, remainder) = split_root(&descriptor.name)
            .ok_or_else(|| ConfigurationError::InvalidSignalName(descriptor.name.clone()))?;
        if signal_root != root {
            continue;
        }
        if descriptor.elements == 0 {
            return Err(ConfigurationError::NoElements(descriptor.name.clone()));
        }
        let name = qualified_name(field_prefix, remainder);
        if signals.iter().any(|s| s.qualified_name == name) {
            return Err(ConfigurationError::DuplicateField(name));
        }
        signals.push(CachedSignal::new(&name, &descriptor.name, memory.clone()));
    }
    Ok(signals)
}
