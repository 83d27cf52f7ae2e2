//! Wiring between the packet input and the outputs.

pub mod input;
pub mod output;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::models::config::AppConfig;
use crate::models::record::Event;
use crate::utils::error::AppResult;

pub use input::{InputMode, PacketInput};
pub use output::{build_outputs, Output};

/// Pumps events from the input into every output
pub struct Pipeline {
    input: PacketInput,
    outputs: Vec<Output>,
    /// Return once the input runs dry instead of waiting for `stop`
    exit_when_drained: bool,
}

impl Pipeline {
    pub fn new(input: PacketInput, outputs: Vec<Output>, exit_when_drained: bool) -> Self {
        Self {
            input,
            outputs,
            exit_when_drained,
        }
    }

    /// Outputs first, so nothing is lost while the input starts producing
    pub fn build(config: &AppConfig, exit_when_drained: bool) -> AppResult<Self> {
        let outputs = build_outputs(&config.outputs)?;
        let input = PacketInput::build(config)?;
        Ok(Self::new(input, outputs, exit_when_drained))
    }

    fn emit(&self, event: &Event) {
        for output in &self.outputs {
            output.emit(event);
        }
    }

    /// Run until `stop` is cancelled (or the input drains, if configured),
    /// then shut everything down in order. Returns the events delivered.
    pub async fn run(self, stop: CancellationToken) -> u64 {
        let mut delivered: u64 = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.input.read_one_event() => match event {
                    Some(event) => {
                        self.emit(&event);
                        delivered += 1;
                    }
                    None if self.exit_when_drained => {
                        info!("Input drained");
                        break;
                    }
                    None => {
                        info!("Input drained, waiting for shutdown signal");
                        stop.cancelled().await;
                        break;
                    }
                },
            }
        }

        // Keep consuming while the input stops; its producers may be blocked
        // on a full queue.
        let drain = async {
            let mut drained: u64 = 0;
            while let Some(event) = self.input.read_one_event().await {
                self.emit(&event);
                drained += 1;
            }
            drained
        };
        let ((), drained) = tokio::join!(self.input.shutdown(), drain);
        delivered += drained;
        info!("Delivered {} event(s), {} after shutdown began", delivered, drained);

        // Aggregators last, after every event has reached them.
        let (aggregators, others): (Vec<_>, Vec<_>) = self
            .outputs
            .iter()
            .partition(|o| matches!(o, Output::SizeRecord(_)));
        for output in others.into_iter().chain(aggregators) {
            output.shutdown().await;
        }

        delivered
    }
}
