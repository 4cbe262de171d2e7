use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{DigsError, DigsResult};

pub const DEFAULT_CONTROL_PORT: u16 = 51000;
pub const CONTROL_RESPONSE_SIZE: usize = 32;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

/// Administrative commands understood by the control node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Ping,
    Retire { node: String },
    Unretire { node: String },
    Disable { node: String },
    Enable { node: String },
    Add { node: String, site: String, path: String },
    Remove { node: String },
    Delete { lfn: String },
    RemoveDirectory { lfn: String },
    PutFile {
        lfn: String,
        group: String,
        permissions: String,
        size: u64,
        md5: String,
        timestamp: i64,
        submitter: String,
    },
    Modify {
        lfn: String,
        node: String,
        md5: String,
        size: u64,
        timestamp: i64,
    },
    Check { node: String },
    Chmod {
        recursive: bool,
        group: String,
        lfn: String,
        public: bool,
    },
    Touch { lfn: String, node: String },
    TouchDirectory { ldn: String, node: String },
    Lock { lfn: String },
    LockDirectory { lfn: String },
    Unlock { lfn: String },
    UnlockDirectory { lfn: String },
    ReplicaCount { lfn: String, count: u32 },
    ReplicaCountDirectory { lfn: String, count: u32 },
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Ping => write!(f, "ping"),
            ControlCommand::Retire { node } => write!(f, "retire {}", node),
            ControlCommand::Unretire { node } => write!(f, "unretire {}", node),
            ControlCommand::Disable { node } => write!(f, "disable {}", node),
            ControlCommand::Enable { node } => write!(f, "enable {}", node),
            ControlCommand::Add { node, site, path } => write!(f, "add {} {} {}", node, site, path),
            ControlCommand::Remove { node } => write!(f, "remove {}", node),
            ControlCommand::Delete { lfn } => write!(f, "delete {}", lfn),
            ControlCommand::RemoveDirectory { lfn } => write!(f, "rmdir {}", lfn),
            ControlCommand::PutFile {
                lfn,
                group,
                permissions,
                size,
                md5,
                timestamp,
                submitter,
            } => write!(
                f,
                "putFile {} {} {} {} {} {} {}",
                lfn,
                group,
                permissions,
                size,
                md5,
                timestamp,
                submitter.replace(' ', "+")
            ),
            ControlCommand::Modify {
                lfn,
                node,
                md5,
                size,
                timestamp,
            } => write!(f, "modify {} {} {} {} {}", lfn, node, md5, size, timestamp),
            ControlCommand::Check { node } => write!(f, "check {}", node),
            ControlCommand::Chmod {
                recursive,
                group,
                lfn,
                public,
            } => write!(
                f,
                "chmod {} {} {} {}",
                if *recursive { 1 } else { 0 },
                group,
                lfn,
                if *public { "public" } else { "private" }
            ),
            ControlCommand::Touch { lfn, node } => write!(f, "touch {} {}", lfn, node),
            ControlCommand::TouchDirectory { ldn, node } => {
                if ldn.ends_with('/') {
                    write!(f, "touchdir {} {}", ldn, node)
                } else {
                    write!(f, "touchdir {}/ {}", ldn, node)
                }
            }
            ControlCommand::Lock { lfn } => write!(f, "lock {}", lfn),
            ControlCommand::LockDirectory { lfn } => write!(f, "lockdir {}", lfn),
            ControlCommand::Unlock { lfn } => write!(f, "unlock {}", lfn),
            ControlCommand::UnlockDirectory { lfn } => write!(f, "unlockdir {}", lfn),
            ControlCommand::ReplicaCount { lfn, count } => write!(f, "replcount {} {}", lfn, count),
            ControlCommand::ReplicaCountDirectory { lfn, count } => {
                write!(f, "replcountdir {} {}", lfn, count)
            }
        }
    }
}

/// Sends one command line and returns the node's raw reply.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_message(&self, message: &str) -> DigsResult<String>;
}

/// Sends `command` and turns a non-`OK` reply into `ControlRejected`.
pub async fn send_command(
    channel: &dyn ControlChannel,
    command: &ControlCommand,
) -> DigsResult<()> {
    let line = command.to_string();
    debug!("control command: {}", line);
    let response = channel.send_message(&line).await?;
    check_response(&response)
}

pub fn check_response(response: &str) -> DigsResult<()> {
    if response.starts_with("OK") {
        Ok(())
    } else {
        Err(DigsError::ControlRejected(response.to_string()))
    }
}

/// One TCP connection per message to the control node's command port.
pub struct MessageSender {
    host: String,
    port: u16,
    timeout: Duration,
}

impl MessageSender {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: CONTROL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, message: &str) -> DigsResult<String> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DigsError::Connection(format!("connect to {} failed: {}", addr, e)))?;

        stream
            .write_all(message.as_bytes())
            .await
            .map_err(|e| DigsError::Transport(format!("send to {} failed: {}", addr, e)))?;
        stream.flush().await?;

        let mut buf = [0u8; CONTROL_RESPONSE_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = stream
                .read(&mut buf[filled..])
                .await
                .map_err(|e| DigsError::Transport(format!("read from {} failed: {}", addr, e)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let _ = stream.shutdown().await;

        let response = String::from_utf8_lossy(&buf[..filled])
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();
        Ok(response)
    }
}

#[async_trait]
impl ControlChannel for MessageSender {
    async fn send_message(&self, message: &str) -> DigsResult<String> {
        match tokio::time::timeout(self.timeout, self.exchange(message)).await {
            Ok(result) => result,
            Err(_) => Err(DigsError::Timeout(format!(
                "control node {}:{} did not answer",
                self.host, self.port
            ))),
        }
    }
}
