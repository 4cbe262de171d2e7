use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Body, Client, Method, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{StorageElement, TransferContext};
use crate::{DigsError, DigsResult, StorageNode, DEFAULT_TRANSFER_TIMEOUT};

pub const DEFAULT_BULK_TRANSFER_PORT: u16 = 2811;
pub const LOCKED_PREFIX: &str = "LOCKED-";
pub const PARTIAL_SUFFIX: &str = ".digs-part";

/// `dir/LOCKED-leaf` for `dir/leaf`.
pub fn locked_name(remote: &str) -> String {
    match remote.rfind('/') {
        Some(pos) => format!("{}/{}{}", &remote[..pos], LOCKED_PREFIX, &remote[pos + 1..]),
        None => format!("{}{}", LOCKED_PREFIX, remote),
    }
}

/// Sibling of `local` that a download is written to until it completes.
pub fn partial_name(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    local.with_file_name(name)
}

/// Streamed file copy to and from one node's transfer server.
///
/// With lock mode on, uploads land under a `LOCKED-` name and are renamed
/// once complete so a half-written file is never visible under its real name.
#[derive(Clone)]
pub struct BulkTransferClient {
    host: String,
    port: u16,
    lock_mode: bool,
    long_timeout: Duration,
    short_timeout: Duration,
    client: Client,
}

impl BulkTransferClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            lock_mode: true,
            long_timeout: DEFAULT_TRANSFER_TIMEOUT,
            short_timeout: DEFAULT_TRANSFER_TIMEOUT,
            client: Client::new(),
        }
    }

    pub fn for_node(node: &StorageNode) -> DigsResult<Self> {
        let port = match node.property("port") {
            Some(p) => p.parse::<u16>().map_err(|_| {
                DigsError::Config(format!("Invalid port {} for node {}", p, node.name))
            })?,
            None => DEFAULT_BULK_TRANSFER_PORT,
        };
        Ok(Self::new(&node.name, port).with_timeouts(node.transfer_timeout(), node.control_timeout()))
    }

    pub fn with_timeouts(mut self, long_timeout: Duration, short_timeout: Duration) -> Self {
        self.long_timeout = long_timeout;
        self.short_timeout = short_timeout;
        self
    }

    pub fn set_lock_mode(&mut self, lock_mode: bool) {
        self.lock_mode = lock_mode;
    }

    pub fn lock_mode(&self) -> bool {
        self.lock_mode
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn url_for(&self, remote: &str) -> String {
        if remote.starts_with('/') {
            format!("http://{}:{}{}", self.host, self.port, remote)
        } else {
            format!("http://{}:{}/{}", self.host, self.port, remote)
        }
    }

    fn status_error(&self, status: StatusCode, remote: &str) -> DigsError {
        if status == StatusCode::NOT_FOUND {
            DigsError::NotFound(format!("{} not found on {}", remote, self.host))
        } else {
            DigsError::Transport(format!("HTTP error: {} for {} on {}", status, remote, self.host))
        }
    }

    async fn with_deadline<T, F>(&self, limit: Duration, what: &str, fut: F) -> DigsResult<T>
    where
        F: std::future::Future<Output = DigsResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DigsError::Timeout(format!(
                "{} on {} timed out after {:?}",
                what, self.host, limit
            ))),
        }
    }

    /// Whole small file in memory, under the short timeout.
    pub async fn get_bytes(&self, remote: &str) -> DigsResult<Vec<u8>> {
        self.with_deadline(self.short_timeout, "fetch", async {
            let url = self.url_for(remote);
            debug!("GET {}", url);
            let res = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| DigsError::Transport(format!("Request {} failed: {}", url, e)))?;
            if !res.status().is_success() {
                return Err(self.status_error(res.status(), remote));
            }
            let body = res
                .bytes()
                .await
                .map_err(|e| DigsError::Transport(format!("Read {} failed: {}", url, e)))?;
            Ok(body.to_vec())
        })
        .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> DigsResult<()> {
        self.with_deadline(self.short_timeout, "rename", async {
            let url = self.url_for(from);
            let method = Method::from_bytes(b"MOVE")
                .map_err(|e| DigsError::Transport(format!("bad method: {}", e)))?;
            let res = self
                .client
                .request(method, &url)
                .header("Destination", to)
                .send()
                .await
                .map_err(|e| DigsError::Transport(format!("Rename {} failed: {}", url, e)))?;
            if !res.status().is_success() {
                return Err(self.status_error(res.status(), from));
            }
            Ok(())
        })
        .await
    }

    async fn upload(&self, local: &Path, remote: &str, ctx: &TransferContext) -> DigsResult<()> {
        let file = tokio::fs::File::open(local).await.map_err(|e| {
            DigsError::NotFound(format!("Local file {} not found: {}", local.display(), e))
        })?;
        let total = file.metadata().await?.len();
        ctx.check(0, Some(total), remote)?;

        let progress = ctx.clone();
        let name = remote.to_string();
        let mut sent = 0u64;
        let stream = tokio_util::io::ReaderStream::new(file).map(move |item| {
            let chunk = item?;
            sent += chunk.len() as u64;
            progress
                .check(sent, Some(total), &name)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;
            Ok::<_, std::io::Error>(chunk)
        });

        let url = self.url_for(remote);
        info!("PUT {} => {} ({} bytes)", local.display(), url, total);
        let res = self
            .client
            .put(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", total.to_string())
            .body(Body::wrap_stream(stream))
            .send()
            .await;
        let res = match res {
            Ok(res) => res,
            Err(e) => {
                if ctx.is_cancelled() {
                    return Err(DigsError::Cancelled(format!("transfer of {} cancelled", remote)));
                }
                return Err(DigsError::Transport(format!("Upload to {} failed: {}", url, e)));
            }
        };
        if !res.status().is_success() {
            return Err(self.status_error(res.status(), remote));
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()> {
        let url = self.url_for(remote);
        info!("GET {} => {}", url, local.display());
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DigsError::Transport(format!("Download from {} failed: {}", url, e)))?;
        if !res.status().is_success() {
            return Err(self.status_error(res.status(), remote));
        }

        let total = res.content_length();
        let mut file = tokio::fs::File::create(local).await.map_err(|e| {
            DigsError::Io(format!("create {} failed: {}", local.display(), e))
        })?;
        let mut received = 0u64;
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| DigsError::Transport(format!("Download from {} failed: {}", url, e)))?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            ctx.check(received, total, remote)?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageElement for BulkTransferClient {
    async fn put_file(&self, local: &Path, remote: &str, ctx: &TransferContext) -> DigsResult<()> {
        if !self.lock_mode {
            return self
                .with_deadline(self.long_timeout, "upload", self.upload(local, remote, ctx))
                .await;
        }

        let staging = locked_name(remote);
        self.with_deadline(self.long_timeout, "upload", self.upload(local, &staging, ctx))
            .await?;
        self.rename(&staging, remote).await
    }

    /// Bytes land in a `.digs-part` sibling that replaces `local` only once
    /// the download has finished; an existing `local` survives any failure.
    async fn get_file(&self, remote: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()> {
        let partial = partial_name(local);
        let result = self
            .with_deadline(self.long_timeout, "download", self.download(remote, &partial, ctx))
            .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, local).await.map_err(|e| {
            DigsError::Io(format!(
                "move {} into place as {} failed: {}",
                partial.display(),
                local.display(),
                e
            ))
        })
    }
}
