// #![warn(missing_docs)]

//! Synchronise real-time signal buffers with structured EPICS process variables.
//!
//! A real-time control application keeps its state in flat, fixed-size, statically
//! typed signals. Remote PVs (as served over PVAccess) hold arbitrarily nested
//! structures of scalars, arrays and sub-structures. This crate maps one onto the
//! other, and moves values across without ever blocking the real-time thread.
//!
//! <div class="warning">This is an early version of this library. Interfaces may
//! change between versions until the design settles.</div>
//!
//! The bridge is separated into:
//!
//! - Representing structured PV values, in module [pvdata].
//! - Local [signal]s: their declarations, memory, and how their names map onto fields
//!   of a remote record. A signal named `Record1.NodeA.Element1` is the field
//!   `value.NodeA.Element1` of the remote record `Record1`.
//! - A [`channel::Channel`] per remote record, which resolves the remote structure
//!   against its signals and implements the two synchronisation protocols:
//!   [`channel::Channel::monitor`] (remote to local) and [`channel::Channel::put`]
//!   (local to remote).
//! - [`providers::Transport`], the trait the channels use to reach remote PVs. The
//!   transport protocol itself is not part of this crate, but an in-process
//!   [`providers::IntercomProvider`] is included for loopback use and testing.
//! - [datasource]s, which own the channels for a set of declared signals and run them:
//!   [`datasource::InputDataSource`] monitors each channel on its own worker thread
//!   (see [executor]), and [`datasource::OutputBroker`] queues snapshots of output
//!   memory for a writer thread driving [`datasource::OutputDataSource`].
//! - Loading all of the above from TOML, in module [config].
//!
//! ## Example
//!
//! Mirroring a single unsigned integer from a remote record into local memory:
//!
//! ```
//! use std::sync::Arc;
//! use pvbridge::{
//!     channel::{Channel, ChannelOptions},
//!     config::ChannelConfig,
//!     providers::IntercomProvider,
//!     pvdata::{PvStructure, ScalarType},
//!     signal::{SignalDescriptor, SignalMemory},
//! };
//!
//! let mut provider = IntercomProvider::new();
//! let _record = provider
//!     .add_pv(
//!         "RecordIn1",
//!         PvStructure::new("").with(
//!             "value",
//!             PvStructure::new("")
//!                 .with("UnsignedIntegers", PvStructure::new("").with("UInt32", 3u32)),
//!         ),
//!     )
//!     .unwrap();
//!
//! let declared = vec![SignalDescriptor::new(
//!     "RecordIn1.UnsignedIntegers.UInt32",
//!     ScalarType::U32,
//! )];
//! let memory = vec![SignalMemory::new(ScalarType::U32, 1)];
//! let mut channel = Channel::from_config(
//!     &ChannelConfig::new("RecordIn1"),
//!     &declared,
//!     &memory,
//!     Arc::new(provider),
//!     ChannelOptions::default(),
//! )
//! .unwrap();
//!
//! channel.monitor().unwrap();
//! assert_eq!(memory[0].load::<u32>(0), 3);
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - All fixed-width integer and floating point signal types, as scalars or arrays.
//!   Values are converted to and from the remote field's own type as long as they
//!   are representable in it.
//! - Structures nested to any depth, and a single level of structure arrays.
//! - Reconnection: a lost connection is re-established on the next call, and the
//!   remote structure is resolved again.
//!
//! What this doesn't do (yet):
//! - String signals. These can be declared, but fail when transferred.
//! - Structure arrays nested inside structure arrays. The field names generated for
//!   these are ambiguous, and only the last matching field is used.

pub mod channel;
pub mod config;
pub mod datasource;
pub mod executor;
pub mod providers;
pub mod pvdata;
pub mod signal;
pub mod utils;

pub use crate::channel::Channel;
pub use crate::providers::Transport;
