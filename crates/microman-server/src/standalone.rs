//! Gateway and workers in one process over the in-process broker

use std::sync::Arc;

use microman_broker::{MemoryBroker, Transport};
use microman_config::Config;
use microman_gateway::{Gateway, GatewayError};
use microman_worker::{RegistryError, TopicRegistry, Worker};
use tokio::net::TcpListener;

pub struct Standalone {
    broker: MemoryBroker,
    gateway: Gateway,
    workers: Vec<Worker>,
}

impl Standalone {
    /// Start a gateway and one worker per dispatch table
    pub fn start(config: &Config, registries: Vec<TopicRegistry>) -> Result<Self, RegistryError> {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.clone());

        let workers = registries
            .into_iter()
            .map(|registry| Worker::start(Arc::clone(&transport), config, registry))
            .collect::<Result<Vec<_>, _>>()?;
        let gateway = Gateway::start(transport, config);

        Ok(Self {
            broker,
            gateway,
            workers,
        })
    }

    /// Wait until every broker channel is usable
    pub async fn ready(&self) -> Result<(), GatewayError> {
        for worker in &self.workers {
            worker.ready().await?;
        }
        self.gateway.ready().await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        self.gateway.serve(listener).await
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub async fn shutdown(&self) {
        self.gateway.shutdown().await;
        for worker in &self.workers {
            worker.shutdown().await;
        }
    }
}
