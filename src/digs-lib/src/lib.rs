mod config_file;
mod control_channel;
mod digs_client;
mod file_list_cache;
mod group_map;
mod logical_file;
mod node_registry;
mod replica_registry;
mod settings;
mod storage_element;
mod storage_node;
mod transport;

#[cfg(test)]
mod test_grid;

pub use config_file::*;
pub use control_channel::*;
pub use digs_client::*;
pub use file_list_cache::*;
pub use group_map::*;
pub use logical_file::*;
pub use node_registry::*;
pub use replica_registry::*;
pub use settings::*;
pub use storage_element::*;
pub use storage_node::*;
pub use transport::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DigsError {
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("Control thread responded: {0}")]
    ControlRejected(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Operation not available with backup node")]
    BackupNodeMode,
    #[error("no storage node available: {0}")]
    NoNodeAvailable(String),
    #[error("All copies of file inaccessible: {0}")]
    AllCopiesInaccessible(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl DigsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DigsError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DigsError::Cancelled(_))
    }
}

pub type DigsResult<T> = std::result::Result<T, DigsError>;

impl From<std::io::Error> for DigsError {
    fn from(err: std::io::Error) -> Self {
        DigsError::Io(err.to_string())
    }
}

pub enum ProgressCallbackResult {
    Continue, //keep transferring
    Stop,     //abort the transfer
}

impl ProgressCallbackResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, ProgressCallbackResult::Continue)
    }
}
