use log::{error, info};
use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::models::config::OutputConfig;
use crate::models::record::Event;
use crate::utils::error::AppResult;

/// Output plugins, resolved from config once at startup
pub enum Output {
    SizeRecord(Arc<Aggregator>),
    Stdout,
}

impl Output {
    /// Build and start one output. Must be called inside a tokio runtime.
    pub fn build(config: &OutputConfig) -> AppResult<Self> {
        match config {
            OutputConfig::SizeRecord(c) => {
                let aggregator = Arc::new(Aggregator::new(c)?);
                aggregator.start();
                Ok(Output::SizeRecord(aggregator))
            }
            OutputConfig::Stdout => Ok(Output::Stdout),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Output::SizeRecord(_) => "size_record",
            Output::Stdout => "stdout",
        }
    }

    pub fn emit(&self, event: &Event) {
        match self {
            Output::SizeRecord(aggregator) => aggregator.emit(event),
            Output::Stdout => match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode event error={}", e),
            },
        }
    }

    pub async fn shutdown(&self) {
        if let Output::SizeRecord(aggregator) = self {
            aggregator.shutdown().await;
        }
        info!("Output {} stopped", self.name());
    }
}

/// Build every configured output, in config order
pub fn build_outputs(configs: &[OutputConfig]) -> AppResult<Vec<Output>> {
    configs.iter().map(Output::build).collect()
}
