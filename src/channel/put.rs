use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, debug_span};

use crate::{
    channel::{
        Channel, ChannelError, Operation, PutTemplate, dispatch::write_leaf, monitor::log_failure,
        resolver::{self, Bindings},
    },
    providers::TransportError,
};

type PutOutcome = Arc<Mutex<Option<Result<(), TransportError>>>>;

impl Channel {
    /// Write the current contents of signal memory to the remote PV
    ///
    /// On first use this fetches the remote value to build a template of the
    /// same structure; every signal must map onto a leaf of it. Each call then
    /// refreshes the template from memory, sends it, and waits for the remote
    /// end to acknowledge it for at most the configured number of checks.
    pub fn put(&mut self) -> Result<(), ChannelError> {
        let _span = debug_span!("put", channel = %self.name).entered();
        let result = self.put_once();
        if let Err(e) = &result {
            log_failure(e);
            match e {
                ChannelError::Connection { .. } => self.disconnect(),
                ChannelError::PutRejected { .. } => {
                    // The remote structure may have changed under us
                    debug!("Discarding put template");
                    self.put_template = None;
                }
                _ => {}
            }
        }
        result
    }

    fn put_once(&mut self) -> Result<(), ChannelError> {
        let mut template = match self.put_template.take() {
            Some(template) => template,
            None => self.build_template()?,
        };
        let result = self.send(&mut template);
        self.put_template = Some(template);
        result
    }

    /// Fetch the remote value and bind every signal to a leaf of it
    fn build_template(&mut self) -> Result<PutTemplate, ChannelError> {
        let value = self
            .ensure_connected()?
            .get()
            .map_err(|e| self.connection_error(Operation::Get, e))?;
        let mut bindings = Bindings::default();
        resolver::resolve(Some(&value), &self.signals, &mut bindings);
        if !bindings.is_complete() {
            return Err(ChannelError::Unresolved {
                channel: self.name.clone(),
                signals: bindings.unbound_names(&self.signals),
            });
        }
        debug!("Built put template");
        Ok(PutTemplate { value, bindings })
    }

    fn send(&mut self, template: &mut PutTemplate) -> Result<(), ChannelError> {
        for (index, signal) in self.signals.iter().enumerate() {
            let Some(leaf) = template
                .bindings
                .get(index)
                .and_then(|path| template.value.get_mut(path))
            else {
                return Err(ChannelError::Unresolved {
                    channel: self.name.clone(),
                    signals: vec![signal.declared_name().to_string()],
                });
            };
            write_leaf(signal, leaf).map_err(|detail| ChannelError::TypeMismatch {
                channel: self.name.clone(),
                signal: signal.declared_name().to_string(),
                signal_type: signal.signal_type(),
                detail,
            })?;
        }

        let outcome = PutOutcome::default();
        let done = {
            let outcome = outcome.clone();
            Box::new(move |result: Result<(), TransportError>| {
                *outcome.lock() = Some(result);
            })
        };
        self.ensure_connected()?
            .put(&template.value, done)
            .map_err(|e| self.connection_error(Operation::Put, e))?;

        let iterations = self.options.put_poll_iterations;
        for _ in 0..iterations {
            let result = outcome.lock().take();
            if let Some(result) = result {
                return self.completed(result);
            }
            self.options.sleeper.sleep(self.options.put_poll_interval);
        }
        let result = outcome.lock().take();
        match result {
            Some(result) => self.completed(result),
            None => Err(ChannelError::Timeout {
                channel: self.name.clone(),
                iterations,
            }),
        }
    }

    fn completed(&self, result: Result<(), TransportError>) -> Result<(), ChannelError> {
        match result {
            Ok(()) => {
                debug!("Put acknowledged");
                Ok(())
            }
            Err(TransportError::Disconnected) => {
                Err(self.connection_error(Operation::Put, TransportError::Disconnected))
            }
            Err(source) => Err(ChannelError::PutRejected {
                channel: self.name.clone(),
                source,
            }),
        }
    }
}
