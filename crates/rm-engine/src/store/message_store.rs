//! Stored envelopes, keyed by the store key held in pending records.

use crate::domain::RmEnvelope;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: BTreeMap<String, RmEnvelope>,
}

impl MessageStore {
    pub fn get(&self, key: &str) -> Option<&RmEnvelope> {
        self.messages.get(key)
    }

    pub fn put(&mut self, key: &str, envelope: RmEnvelope) -> Option<RmEnvelope> {
        self.messages.insert(key.to_string(), envelope)
    }

    pub fn remove(&mut self, key: &str) -> Option<RmEnvelope> {
        self.messages.remove(key)
    }

    pub fn restore(&mut self, key: &str, prior: Option<RmEnvelope>) {
        match prior {
            Some(envelope) => {
                self.messages.insert(key.to_string(), envelope);
            }
            None => {
                self.messages.remove(key);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RmEnvelope)> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
