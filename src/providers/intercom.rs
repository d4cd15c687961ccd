use std::{collections::HashMap, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    providers::{
        Connection, EventKind, MonitorEvent, PutCallback, Subscription, Transport, TransportError,
    },
    pvdata::PvStructure,
};

struct PV {
    name: String,
    value: PvStructure,
    /// Cleared when the PV is removed from its provider
    available: bool,
    /// Channels to send updates to any interested listeners
    subscribers: Vec<Sender<MonitorEvent>>,
    /// If set, put completions are queued instead of being acknowledged
    hold_puts: bool,
    held: Vec<PutCallback>,
    /// How many puts have been accepted
    puts: usize,
}

impl PV {
    fn new(name: &str, value: PvStructure) -> Self {
        PV {
            name: name.to_owned(),
            value,
            available: true,
            subscribers: Vec::new(),
            hold_puts: false,
            held: Vec::new(),
            puts: 0,
        }
    }

    /// Send an event to every subscriber, forgetting any that have gone away
    fn notify(&mut self, event: &MonitorEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    /// Tell all subscribers their subscription is over
    fn drop_subscribers(&mut self) {
        self.notify(&MonitorEvent::signal(EventKind::Disconnected));
        self.subscribers.clear();
    }

    fn store(&mut self, value: PvStructure) {
        if !self.value.same_shape(&value) {
            debug!(
                "Intercom: Structure of {} changed, dropping subscribers",
                self.name
            );
            self.value = value;
            self.drop_subscribers();
            return;
        }
        self.value = value;
        let event = MonitorEvent::data(self.value.clone());
        self.notify(&event);
    }
}

/// Handle to read and write a single PV held by an [`IntercomProvider`]
#[derive(Clone)]
pub struct Intercom {
    pv: Arc<Mutex<PV>>,
}

impl Intercom {
    pub fn name(&self) -> String {
        self.pv.lock().name.clone()
    }

    pub fn load(&self) -> PvStructure {
        self.pv.lock().value.clone()
    }

    /// Replace the value and notify subscribers
    ///
    /// If the new value has a different structure, existing subscriptions are
    /// ended with a disconnect event instead.
    pub fn store(&self, value: PvStructure) {
        self.pv.lock().store(value);
    }

    /// Modify the value in place and notify subscribers
    pub fn update<F: FnOnce(&mut PvStructure)>(&self, f: F) {
        let mut pv = self.pv.lock();
        let mut value = pv.value.clone();
        f(&mut value);
        pv.store(value);
    }

    /// End every current subscription with a disconnect event
    pub fn disconnect_subscribers(&self) {
        self.pv.lock().drop_subscribers();
    }

    /// Stop (or resume) acknowledging puts
    ///
    /// Resuming acknowledges everything that was held back.
    pub fn hold_put_acknowledgements(&self, hold: bool) {
        let held = {
            let mut pv = self.pv.lock();
            pv.hold_puts = hold;
            if hold {
                Vec::new()
            } else {
                std::mem::take(&mut pv.held)
            }
        };
        for done in held {
            done(Ok(()));
        }
    }

    pub fn put_count(&self) -> usize {
        self.pv.lock().puts
    }

    pub fn subscriber_count(&self) -> usize {
        self.pv.lock().subscribers.len()
    }
}

#[derive(Debug, Error)]
#[error("a PV with this name already exists")]
pub struct PVAlreadyExists;

/// An in-process PV store
///
/// PVs live in memory and are shared by every clone of the provider. Used for
/// loopback operation and for testing the bridge without a network.
#[derive(Clone, Default)]
pub struct IntercomProvider {
    pvs: Arc<Mutex<HashMap<String, Arc<Mutex<PV>>>>>,
    /// A Prefix that is inserted in front of any PV name
    pub prefix: String,
}

impl IntercomProvider {
    pub fn new() -> IntercomProvider {
        IntercomProvider::default()
    }

    pub fn add_pv(
        &mut self,
        name: &str,
        initial_value: PvStructure,
    ) -> Result<Intercom, PVAlreadyExists> {
        let mut pvmap = self.pvs.lock();
        if pvmap.contains_key(name) {
            return Err(PVAlreadyExists);
        }
        let pv = Arc::new(Mutex::new(PV::new(name, initial_value)));
        pvmap.insert(name.to_owned(), pv.clone());
        Ok(Intercom { pv })
    }

    /// Remove a PV. Subscribers are disconnected and open connections fail from now on.
    pub fn remove_pv(&mut self, name: &str) -> bool {
        let Some(pv) = self.pvs.lock().remove(name) else {
            return false;
        };
        let mut pv = pv.lock();
        pv.available = false;
        pv.drop_subscribers();
        true
    }

    pub fn pv(&self, name: &str) -> Option<Intercom> {
        self.pvs
            .lock()
            .get(name)
            .map(|pv| Intercom { pv: pv.clone() })
    }

    /// Normalize a PV name by stripping the prefix
    fn normalize_pv_name<'a>(&self, pv_name: &'a str) -> Option<&'a str> {
        pv_name.strip_prefix(self.prefix.as_str())
    }
}

impl Transport for IntercomProvider {
    fn connect(&self, pv_name: &str) -> Result<Box<dyn Connection>, TransportError> {
        let pv = self
            .normalize_pv_name(pv_name)
            .and_then(|name| self.pvs.lock().get(name).cloned())
            .ok_or_else(|| TransportError::NotFound(pv_name.to_owned()))?;
        debug!("Intercom: Connected to {pv_name}");
        Ok(Box::new(IntercomConnection { pv }))
    }
}

struct IntercomConnection {
    pv: Arc<Mutex<PV>>,
}

impl IntercomConnection {
    fn checked(&self) -> Result<parking_lot::MutexGuard<'_, PV>, TransportError> {
        let pv = self.pv.lock();
        if !pv.available {
            return Err(TransportError::Disconnected);
        }
        Ok(pv)
    }
}

impl Connection for IntercomConnection {
    fn get(&mut self) -> Result<PvStructure, TransportError> {
        Ok(self.checked()?.value.clone())
    }

    fn monitor(&mut self) -> Result<Box<dyn Subscription>, TransportError> {
        let mut pv = self.checked()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        // A new subscriber always starts with the current value
        let _ = tx.send(MonitorEvent::signal(EventKind::Connected));
        let _ = tx.send(MonitorEvent::data(pv.value.clone()));
        pv.subscribers.push(tx);
        Ok(Box::new(IntercomSubscription { rx, pending: None }))
    }

    fn put(&mut self, value: &PvStructure, done: PutCallback) -> Result<(), TransportError> {
        let mut pv = self.checked()?;
        if !pv.value.same_shape(value) {
            warn!("Intercom: Rejecting put to {}: structure mismatch", pv.name);
            drop(pv);
            done(Err(TransportError::Rejected(
                "value does not match the PV structure".to_string(),
            )));
            return Ok(());
        }
        debug!("Intercom: Processing put to {}", pv.name);
        pv.puts += 1;
        pv.store(value.clone());
        if pv.hold_puts {
            pv.held.push(done);
        } else {
            drop(pv);
            done(Ok(()));
        }
        Ok(())
    }
}

struct IntercomSubscription {
    rx: Receiver<MonitorEvent>,
    /// An event taken off the channel by `wait`, not yet polled
    pending: Option<MonitorEvent>,
}

impl Subscription for IntercomSubscription {
    fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.pending.is_some() || !self.rx.is_empty() {
            return Ok(true);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.pending = Some(event);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn poll(&mut self) -> Result<Option<MonitorEvent>, TransportError> {
        if let Some(event) = self.pending.take() {
            return Ok(Some(event));
        }
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}
