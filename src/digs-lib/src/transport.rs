use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    create_storage_element, BulkTransferClient, ControlChannel, DigsResult, MessageSender,
    ReplicaRegistry, RlsClient, StorageElement, StorageNode, DEFAULT_BULK_TRANSFER_PORT,
};

/// Factory for every network peer the client talks to.
#[async_trait]
pub trait GridTransport: Send + Sync {
    /// Small file from a node's install tree, e.g. the grid configuration.
    async fn fetch_file(&self, host: &str, path: &str) -> DigsResult<Vec<u8>>;

    async fn open_registry(&self, host: &str, port: u16) -> DigsResult<Arc<dyn ReplicaRegistry>>;

    fn control_channel(&self, host: &str, port: u16) -> Arc<dyn ControlChannel>;

    fn storage_element(&self, node: &StorageNode) -> DigsResult<Arc<dyn StorageElement>>;
}

pub struct NetworkTransport {
    config_port: u16,
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self {
            config_port: DEFAULT_BULK_TRANSFER_PORT,
        }
    }

    pub fn with_config_port(config_port: u16) -> Self {
        Self { config_port }
    }
}

impl Default for NetworkTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GridTransport for NetworkTransport {
    async fn fetch_file(&self, host: &str, path: &str) -> DigsResult<Vec<u8>> {
        BulkTransferClient::new(host, self.config_port)
            .get_bytes(path)
            .await
    }

    async fn open_registry(&self, host: &str, port: u16) -> DigsResult<Arc<dyn ReplicaRegistry>> {
        let client = RlsClient::connect(host, port).await?;
        Ok(Arc::new(client))
    }

    fn control_channel(&self, host: &str, port: u16) -> Arc<dyn ControlChannel> {
        Arc::new(MessageSender::new(host, port))
    }

    fn storage_element(&self, node: &StorageNode) -> DigsResult<Arc<dyn StorageElement>> {
        create_storage_element(node)
    }
}
