//! Two-engine fixture on a shared [`MockTimeSource`].

use rm_engine::domain::{MessageType, SenderBean, SenderQuery};
use rm_engine::{
    LoopbackNetwork, MockTimeSource, RecordingDeliverer, RmConfig, RmEngine, RmResult,
};
use std::sync::Arc;

pub const SERVER: &str = "loop://server/rm";
pub const CLIENT: &str = "loop://client/rm";

/// Passes after which [`Harness::settle`] gives up.
pub const MAX_ROUNDS: usize = 32;

pub struct Harness {
    pub network: Arc<LoopbackNetwork>,
    pub clock: Arc<MockTimeSource>,
    pub client: RmEngine,
    pub server: RmEngine,
    pub client_inbox: Arc<RecordingDeliverer>,
    pub server_inbox: Arc<RecordingDeliverer>,
}

impl Harness {
    pub fn new() -> RmResult<Self> {
        Self::with_config(RmConfig::for_testing())
    }

    /// Both engines share `config` and the clock; both endpoints are registered.
    pub fn with_config(config: RmConfig) -> RmResult<Self> {
        let network = LoopbackNetwork::new();
        let clock = Arc::new(MockTimeSource::new(1_000_000));
        let client_inbox = Arc::new(RecordingDeliverer::new());
        let server_inbox = Arc::new(RecordingDeliverer::new());

        let client = RmEngine::with_time_source(
            config.clone(),
            Arc::new(network.transport()),
            client_inbox.clone(),
            clock.clone(),
        )?;
        let server = RmEngine::with_time_source(
            config,
            Arc::new(network.transport()),
            server_inbox.clone(),
            clock.clone(),
        )?;
        network.register(CLIENT, client.context());
        network.register(SERVER, server.context());

        Ok(Self {
            network,
            clock,
            client,
            server,
            client_inbox,
            server_inbox,
        })
    }

    /// One polling, sending and delivery pass on each engine.
    pub fn pump(&self) -> RmResult<usize> {
        let mut activity = 0;
        for engine in [&self.client, &self.server] {
            activity += engine.polling().poll_once()?;
            activity += engine.sender().send_due()?;
            activity += engine.invoker().deliver_pending()?;
        }
        Ok(activity)
    }

    /// Pump until a pass does nothing; returns the passes used.
    pub fn settle(&self) -> RmResult<usize> {
        for round in 1..=MAX_ROUNDS {
            if self.pump()? == 0 {
                return Ok(round);
            }
        }
        Ok(MAX_ROUNDS)
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
    }

    /// Pending application messages of `engine`, by message number.
    pub fn pending_application(engine: &RmEngine) -> Vec<u64> {
        let mut numbers: Vec<u64> = engine
            .context()
            .store
            .snapshot::<SenderBean, _>(&SenderQuery {
                message_type: Some(MessageType::Application),
                ..Default::default()
            })
            .into_iter()
            .map(|bean| bean.message_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}
