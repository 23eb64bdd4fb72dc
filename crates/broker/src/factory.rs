use std::sync::Arc;

use tracing::info;

use taskq_core::config::{BrokerBackend, BrokerConfig};
use taskq_core::errors::Result;
use taskq_core::traits::broker::Broker;

use crate::in_memory::InMemoryBroker;
use crate::nats::NatsBroker;

/// Builds the configured broker backend.
pub struct BrokerFactory;

impl BrokerFactory {
    pub async fn create(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
        config.validate()?;
        match config.backend {
            BrokerBackend::Nats => {
                let broker = NatsBroker::connect(config).await?;
                Ok(Arc::new(broker))
            }
            BrokerBackend::Memory => {
                info!("using in-memory broker, records will not survive restart");
                Ok(Arc::new(InMemoryBroker::new()))
            }
        }
    }
}
