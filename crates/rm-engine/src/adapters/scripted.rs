use crate::domain::RmEnvelope;
use crate::ports::{Transport, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Builds the back-channel response for a transmitted message.
pub type Responder = Box<dyn Fn(&RmEnvelope) -> Option<RmEnvelope> + Send + Sync>;

/// Controllable transport for unit tests.
///
/// Records every attempted transmission, fails on demand and answers
/// through an optional [`Responder`].
#[derive(Default)]
pub struct ScriptedTransport {
    sent: Mutex<Vec<RmEnvelope>>,
    failing: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&RmEnvelope) -> Option<RmEnvelope> + Send + Sync + 'static,
    {
        let transport = Self::new();
        *transport.responder.lock() = Some(Box::new(responder));
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every transmission attempt so far, failed ones included.
    pub fn sent(&self) -> Vec<RmEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, envelope: &RmEnvelope) -> Result<Option<RmEnvelope>, TransportError> {
        self.sent.lock().push(envelope.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                address: envelope
                    .to
                    .as_ref()
                    .map(|epr| epr.address.clone())
                    .unwrap_or_default(),
            });
        }
        Ok(self
            .responder
            .lock()
            .as_ref()
            .and_then(|responder| responder(envelope)))
    }
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("sent", &self.sent_count())
            .field("failing", &self.failing.load(Ordering::SeqCst))
            .finish()
    }
}
