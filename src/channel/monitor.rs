use tracing::{debug, debug_span, error, info, trace, warn};

use crate::{
    channel::{Channel, ChannelError, Operation, dispatch::read_leaf, resolver},
    providers::{EventKind, Subscription, TransportError},
    pvdata::PvStructure,
};

impl Channel {
    /// Wait for remote updates and copy any that arrive into signal memory
    ///
    /// Connects and subscribes first if needed. Blocks for at most the
    /// configured monitor wait; returns successfully with memory untouched if
    /// nothing arrived. After a transport failure the connection is dropped so
    /// that the next call starts again from scratch.
    pub fn monitor(&mut self) -> Result<(), ChannelError> {
        let _span = debug_span!("monitor", channel = %self.name).entered();
        let result = self.monitor_once();
        if let Err(e) = &result {
            log_failure(e);
            if e.is_connection() {
                self.disconnect();
            }
        }
        result
    }

    fn monitor_once(&mut self) -> Result<(), ChannelError> {
        let mut subscription = match self.subscription.take() {
            Some(subscription) => subscription,
            None => {
                let subscription = self
                    .ensure_connected()?
                    .monitor()
                    .map_err(|e| self.connection_error(Operation::Subscribe, e))?;
                debug!("Subscribed");
                // A fresh subscription may see a different structure
                self.structure_resolved = false;
                subscription
            }
        };
        let result = self.drain(subscription.as_mut());
        if !matches!(&result, Err(e) if e.is_connection()) {
            self.subscription = Some(subscription);
        }
        result
    }

    /// Wait for, then apply, every pending event
    fn drain(&mut self, subscription: &mut dyn Subscription) -> Result<(), ChannelError> {
        let available = subscription
            .wait(self.options.monitor_wait)
            .map_err(|e| self.connection_error(Operation::Wait, e))?;
        if !available {
            trace!("No update");
            return Ok(());
        }
        while let Some(event) = subscription
            .poll()
            .map_err(|e| self.connection_error(Operation::Poll, e))?
        {
            match event.kind {
                EventKind::Data => self.apply(event.root.as_ref())?,
                EventKind::Connected => debug!("Subscription connected"),
                EventKind::Disconnected => {
                    return Err(
                        self.connection_error(Operation::Poll, TransportError::Disconnected)
                    );
                }
                EventKind::Cancelled => {
                    return Err(self.connection_error(
                        Operation::Poll,
                        TransportError::Other("subscription cancelled".to_string()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Copy every bound leaf of an update into signal memory
    fn apply(&mut self, root: Option<&PvStructure>) -> Result<(), ChannelError> {
        let Some(root) = root else {
            warn!("Data event without a value");
            return Ok(());
        };
        if !self.structure_resolved {
            self.structure_resolved =
                resolver::resolve(Some(root), &self.signals, &mut self.bindings);
            let unbound = self.bindings.unbound_names(&self.signals);
            if !unbound.is_empty() {
                warn!("No field for signals {unbound:?}, these will not be updated");
            }
        }
        for (index, signal) in self.signals.iter().enumerate() {
            let Some(leaf) = self.bindings.get(index).and_then(|path| root.get(path)) else {
                continue;
            };
            read_leaf(signal, leaf).map_err(|detail| ChannelError::TypeMismatch {
                channel: self.name.clone(),
                signal: signal.declared_name().to_string(),
                signal_type: signal.signal_type(),
                detail,
            })?;
        }
        Ok(())
    }
}

/// Log a protocol failure at a level matching how serious it is
pub(super) fn log_failure(error: &ChannelError) {
    match error {
        ChannelError::Connection { .. } => info!("{error}"),
        ChannelError::TypeMismatch { .. } => error!("{error}"),
        ChannelError::Unresolved { .. }
        | ChannelError::Timeout { .. }
        | ChannelError::PutRejected { .. } => warn!("{error}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::fmt::TestWriter;

    use crate::{
        channel::{Channel, ChannelError, ChannelOptions},
        providers::IntercomProvider,
        pvdata::{PvStructure, ScalarType},
        signal::{CachedSignal, SignalMemory},
    };

    fn options() -> ChannelOptions {
        ChannelOptions {
            monitor_wait: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn signal(name: &str, signal_type: ScalarType, elements: usize) -> CachedSignal {
        CachedSignal::new(name, name, SignalMemory::new(signal_type, elements))
    }

    #[test]
    fn monitor_applies_updates() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::TRACE)
            .with_writer(TestWriter::new())
            .try_init();
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 3u32))
            .unwrap();
        let signals = vec![signal("value", ScalarType::U32, 1)];
        let mut channel = Channel::new("R", "R", "value", signals, Arc::new(provider), options());

        channel.monitor().unwrap();
        assert!(channel.is_structure_resolved());
        assert_eq!(channel.signals()[0].memory().load::<u32>(0), 3);

        // Nothing new: memory is unchanged
        channel.monitor().unwrap();
        assert_eq!(channel.signals()[0].memory().load::<u32>(0), 3);

        pv.store(PvStructure::new("").with("value", 4u32));
        channel.monitor().unwrap();
        assert_eq!(channel.signals()[0].memory().load::<u32>(0), 4);
    }

    #[test]
    fn monitor_type_mismatch_keeps_subscription() {
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", -1i32))
            .unwrap();
        let signals = vec![signal("value", ScalarType::U8, 1)];
        let mut channel = Channel::new("R", "R", "value", signals, Arc::new(provider), options());
        assert!(matches!(
            channel.monitor(),
            Err(ChannelError::TypeMismatch { .. })
        ));
        assert!(channel.is_connected());
        pv.store(PvStructure::new("").with("value", 7i32));
        channel.monitor().unwrap();
        assert_eq!(channel.signals()[0].memory().load::<u8>(0), 7);
        assert_eq!(pv.subscriber_count(), 1);
    }

    #[test]
    fn monitor_connection_failure_resets() {
        let provider = IntercomProvider::new();
        let signals = vec![signal("value", ScalarType::U8, 1)];
        let mut channel = Channel::new(
            "Missing",
            "Missing",
            "value",
            signals,
            Arc::new(provider.clone()),
            options(),
        );
        let err = channel.monitor().unwrap_err();
        assert!(err.is_connection());
        assert!(!channel.is_connected());
    }

    #[test]
    fn monitor_drains_the_backlog_in_one_call() {
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 1i64))
            .unwrap();
        let signals = vec![signal("value", ScalarType::I64, 1)];
        let mut channel = Channel::new("R", "R", "value", signals, Arc::new(provider), options());
        channel.monitor().unwrap();

        pv.store(PvStructure::new("").with("value", 2i64));
        pv.store(PvStructure::new("").with("value", 3i64));
        channel.monitor().unwrap();
        assert_eq!(channel.signals()[0].memory().load::<i64>(0), 3);

        // Nothing is left over for the next call
        channel.signals()[0].memory().store(0, 0i64);
        channel.monitor().unwrap();
        assert_eq!(channel.signals()[0].memory().load::<i64>(0), 0);
    }

    #[test]
    fn monitor_resubscribes_after_remote_disconnect() {
        let mut provider = IntercomProvider::new();
        let pv = provider
            .add_pv("R", PvStructure::new("").with("value", 5u16))
            .unwrap();
        let signals = vec![signal("value", ScalarType::U16, 1)];
        let mut channel = Channel::new("R", "R", "value", signals, Arc::new(provider), options());
        channel.monitor().unwrap();
        assert_eq!(pv.subscriber_count(), 1);

        pv.disconnect_subscribers();
        assert_eq!(pv.subscriber_count(), 0);
        assert!(channel.monitor().unwrap_err().is_connection());
        assert!(!channel.is_structure_resolved());

        pv.store(PvStructure::new("").with("value", 6u16));
        channel.monitor().unwrap();
        assert!(channel.is_structure_resolved());
        assert_eq!(pv.subscriber_count(), 1);
        assert_eq!(channel.signals()[0].memory().load::<u16>(0), 6);
    }
}
