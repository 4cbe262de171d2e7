mod bulk_transfer;
mod srm;

pub use bulk_transfer::*;
pub use srm::*;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{BackendType, DigsError, DigsResult, ProgressCallbackResult, StorageNode};

/// Observer for bytes moved by a storage element.
pub trait TransferMonitor: Send + Sync {
    fn update_bytes_transferred(&self, transferred: u64, total: Option<u64>)
        -> ProgressCallbackResult;
}

/// Per-call context handed to every transfer: a progress sink and a
/// cancellation signal, both observed between buffered chunks.
#[derive(Clone, Default)]
pub struct TransferContext {
    pub monitor: Option<Arc<dyn TransferMonitor>>,
    pub cancel: CancellationToken,
}

impl TransferContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(monitor: Arc<dyn TransferMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reports progress and fails with `Cancelled` when the caller asked to stop.
    pub fn check(&self, transferred: u64, total: Option<u64>, what: &str) -> DigsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DigsError::Cancelled(format!("transfer of {} cancelled", what)));
        }
        if let Some(monitor) = &self.monitor {
            if !monitor.update_bytes_transferred(transferred, total).is_continue() {
                self.cancel.cancel();
                return Err(DigsError::Cancelled(format!("transfer of {} stopped", what)));
            }
        }
        Ok(())
    }
}

/// Byte transport to one storage node.
#[async_trait]
pub trait StorageElement: Send + Sync {
    async fn put_file(&self, local: &Path, remote: &str, ctx: &TransferContext) -> DigsResult<()>;

    async fn get_file(&self, remote: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()>;
}

/// Adapter for `node`, chosen by its backend type. Nodes without a declared
/// type and OMERO nodes speak the bulk-transfer protocol.
pub fn create_storage_element(node: &StorageNode) -> DigsResult<Arc<dyn StorageElement>> {
    match node.backend {
        BackendType::StorageResourceManager => Ok(Arc::new(SrmAdaptor::for_node(node)?)),
        BackendType::BulkTransfer | BackendType::Unspecified | BackendType::Omero => {
            Ok(Arc::new(BulkTransferClient::for_node(node)?))
        }
    }
}
