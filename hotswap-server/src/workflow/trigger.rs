//! Trigger stage
//!
//! Turns external trigger signals into `triggered` events on the deploy
//! channel.

use hotswap_core::domain::event::{Envs, Event, TRIGGERED};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STAGE: &str = "trigger";

/// External request to start a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSignal {
    /// Cycle id, carried through every stage to the outcome
    pub id: String,

    /// What caused the cycle (`push:<repo>`, a manual action name, ...)
    pub action: String,
}

impl TriggerSignal {
    /// The event handed to the deploy stage
    pub fn into_event(self) -> Event {
        Event::new(self.id, TRIGGERED, Envs::new().with("action", self.action))
    }
}

pub struct TriggerStage;

impl TriggerStage {
    pub async fn run(
        self,
        cancel: CancellationToken,
        mut signals: mpsc::UnboundedReceiver<TriggerSignal>,
        deploy: mpsc::UnboundedSender<Event>,
    ) -> anyhow::Result<()> {
        info!("Trigger stage started");

        loop {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            debug!("Cycle {} triggered by {}", signal.id, signal.action);
            if deploy.send(signal.into_event()).is_err() {
                warn!("Deploy stage is gone");
                break;
            }
        }

        info!("Trigger stage stopped");
        Ok(())
    }
}
