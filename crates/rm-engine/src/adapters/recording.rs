use crate::ports::{Delivery, DeliveryError, MessageDeliverer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Deliverer that keeps every delivery in arrival order.
#[derive(Debug, Default)]
pub struct RecordingDeliverer {
    deliveries: Mutex<Vec<Delivery>>,
    failing: AtomicBool,
}

impl RecordingDeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every delivery while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.lock().is_empty()
    }

    /// Message numbers delivered for `sequence_id`, in delivery order.
    pub fn numbers_for(&self, sequence_id: &str) -> Vec<u64> {
        self.deliveries
            .lock()
            .iter()
            .filter(|delivery| delivery.sequence_id == sequence_id)
            .map(|delivery| delivery.message_number)
            .collect()
    }
}

impl MessageDeliverer for RecordingDeliverer {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::new("deliverer rejecting messages"));
        }
        self.deliveries.lock().push(delivery.clone());
        Ok(())
    }
}
