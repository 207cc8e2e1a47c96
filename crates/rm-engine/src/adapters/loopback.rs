//! In-process network between engines.
//!
//! Each engine registers its context under an address. Sending to that
//! address runs the inbound dispatch of the target engine on the calling
//! thread and hands back its back-channel response. Endpoints can be taken
//! offline to simulate an unreachable peer.

use crate::domain::RmEnvelope;
use crate::ports::{Transport, TransportError};
use crate::processors::{dispatch, EngineContext};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    endpoints: RwLock<HashMap<String, Weak<EngineContext>>>,
    offline: RwLock<HashSet<String>>,
    delivered: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route messages for `address` to `ctx`.
    pub fn register(&self, address: impl Into<String>, ctx: &Arc<EngineContext>) {
        self.endpoints
            .write()
            .insert(address.into(), Arc::downgrade(ctx));
    }

    pub fn unregister(&self, address: &str) {
        self.endpoints.write().remove(address);
    }

    /// Refuse (or accept again) every message for `address`.
    pub fn set_offline(&self, address: &str, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    /// Messages that reached an endpoint.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn transport(self: &Arc<Self>) -> LoopbackTransport {
        LoopbackTransport {
            network: Arc::clone(self),
        }
    }

    fn route(&self, envelope: &RmEnvelope) -> Result<Option<RmEnvelope>, TransportError> {
        let address = envelope
            .to
            .as_ref()
            .map(|epr| epr.address.clone())
            .ok_or_else(|| TransportError::Unreachable {
                address: "<none>".to_string(),
            })?;
        if self.offline.read().contains(&address) {
            return Err(TransportError::Unreachable { address });
        }
        let target = self
            .endpoints
            .read()
            .get(&address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable {
                address: address.clone(),
            })?;

        self.delivered.fetch_add(1, Ordering::SeqCst);
        debug!("[rm-engine] Loopback {} -> {}", envelope.message_id, address);
        dispatch(&target, envelope.clone()).map_err(|err| TransportError::Rejected {
            reason: err.to_string(),
        })
    }
}

/// [`Transport`] handle onto a [`LoopbackNetwork`].
#[derive(Clone, Debug)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, envelope: &RmEnvelope) -> Result<Option<RmEnvelope>, TransportError> {
        self.network.route(envelope)
    }
}
