//! Retransmission policy applied before every transmission attempt.

use crate::config::RmConfig;
use crate::domain::{RmsBean, SenderBean, Timestamp};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Transmit now; the record is due again at `next_time_to_send`.
    Send { next_time_to_send: i64 },
    /// Stop retrying and time the sequence out.
    GiveUp { reason: String },
}

/// Count one more attempt for `bean` and decide whether it may go out.
pub fn adjust(
    config: &RmConfig,
    bean: &mut SenderBean,
    rms: Option<&RmsBean>,
    now: Timestamp,
) -> Decision {
    if let (Some(timeout), Some(rms)) = (config.inactivity_timeout, rms) {
        if now.saturating_sub(rms.last_activated_time) > timeout.as_millis() as u64 {
            return Decision::GiveUp {
                reason: format!(
                    "inactivity timeout of {} ms exceeded",
                    timeout.as_millis()
                ),
            };
        }
    }

    bean.sent_count = bean.sent_count.saturating_add(1);
    if bean.resend {
        if let Some(max) = config.max_retransmission_count {
            if bean.sent_count > max {
                return Decision::GiveUp {
                    reason: format!("maximum retransmission count {} exceeded", max),
                };
            }
        }
    }

    let delay = config.retransmission_delay(bean.sent_count).as_millis() as u64;
    Decision::Send {
        next_time_to_send: now.saturating_add(delay).min(i64::MAX as u64) as i64,
    }
}
