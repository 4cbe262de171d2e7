use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use super::{BulkTransferClient, StorageElement, TransferContext, DEFAULT_BULK_TRANSFER_PORT};
use crate::{DigsError, DigsResult, StorageNode};

pub const SRM_POLL_INTERVAL: Duration = Duration::from_secs(1);

const SRM_SUCCESS_CODES: [&str; 11] = [
    "SRM_SUCCESS",
    "SRM_REQUEST_QUEUED",
    "SRM_REQUEST_INPROGRESS",
    "SRM_REQUEST_SUSPENDED",
    "SRM_RELEASED",
    "SRM_FILE_PINNED",
    "SRM_FILE_IN_CACHE",
    "SRM_SPACE_AVAILABLE",
    "SRM_LOWER_SPACE_GRANTED",
    "SRM_DONE",
    "SRM_PARTIAL_SUCCESS",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrmReturnStatus {
    pub status_code: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl SrmReturnStatus {
    pub fn is_success(&self) -> bool {
        SRM_SUCCESS_CODES.contains(&self.status_code.as_str())
    }

    pub fn describe(&self) -> String {
        match &self.explanation {
            Some(e) => format!("{}: {}", self.status_code, e),
            None => self.status_code.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SrmPrepareRequest<'a> {
    surl: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SrmPrepareResponse {
    return_status: SrmReturnStatus,
    #[serde(default)]
    request_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SrmTokenRequest<'a> {
    surl: &'a str,
    request_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SrmStatusResponse {
    return_status: SrmReturnStatus,
    #[serde(default)]
    file_status: Option<SrmReturnStatus>,
    #[serde(default)]
    transfer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SrmDoneResponse {
    return_status: SrmReturnStatus,
}

/// Host, port and path of a `gsiftp://` transfer URL.
pub fn parse_transfer_url(transfer_url: &str) -> DigsResult<(String, u16, String)> {
    if !transfer_url.starts_with("gsiftp://") {
        return Err(DigsError::Transport(format!(
            "SRM server returned a non-gsiftp URL: {}",
            transfer_url
        )));
    }
    let url = Url::parse(transfer_url)
        .map_err(|e| DigsError::Transport(format!("bad transfer URL {}: {}", transfer_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| DigsError::Transport(format!("transfer URL {} has no host", transfer_url)))?
        .to_string();
    let port = url.port().unwrap_or(DEFAULT_BULK_TRANSFER_PORT);
    Ok((host, port, url.path().to_string()))
}

#[derive(Clone, Copy)]
enum Direction {
    Put,
    Get,
}

impl Direction {
    fn status_method(&self) -> &'static str {
        match self {
            Direction::Put => "srmStatusOfPutRequest",
            Direction::Get => "srmStatusOfGetRequest",
        }
    }

    fn failure(&self) -> &'static str {
        match self {
            Direction::Put => "Error putting file to SRM",
            Direction::Get => "Error getting file from SRM",
        }
    }
}

/// Storage resource manager front end: negotiate a transfer URL, move the
/// bytes with the bulk-transfer client, then confirm uploads.
pub struct SrmAdaptor {
    node_name: String,
    endpoint: String,
    poll_interval: Duration,
    long_timeout: Duration,
    short_timeout: Duration,
    client: Client,
}

impl SrmAdaptor {
    pub fn for_node(node: &StorageNode) -> DigsResult<Self> {
        let endpoint = node.property("endpoint").ok_or_else(|| {
            DigsError::Config(format!("SRM node {} is missing endpoint property", node.name))
        })?;
        Ok(Self {
            node_name: node.name.clone(),
            endpoint: normalize_endpoint(endpoint),
            poll_interval: SRM_POLL_INTERVAL,
            long_timeout: node.transfer_timeout(),
            short_timeout: node.control_timeout(),
            client: Client::new(),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn surl(&self, path: &str) -> String {
        format!("srm://{}{}", self.node_name, path)
    }

    async fn call<Req, Resp>(&self, method: &str, body: &Req) -> DigsResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, method);
        debug!("SRM call {}", url);
        let res = self
            .client
            .post(&url)
            .timeout(self.short_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| DigsError::Transport(format!("SRM {} failed: {}", method, e)))?;
        if !res.status().is_success() {
            return Err(DigsError::Transport(format!(
                "SRM {} HTTP error: {}",
                method,
                res.status()
            )));
        }
        res.json::<Resp>()
            .await
            .map_err(|e| DigsError::Transport(format!("SRM {} bad response: {}", method, e)))
    }

    async fn wait_for_transfer_url(
        &self,
        direction: Direction,
        surl: &str,
        token: &str,
        ctx: &TransferContext,
    ) -> DigsResult<String> {
        let started = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(DigsError::Cancelled(format!("SRM request for {} cancelled", surl)));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let status: SrmStatusResponse = self
                .call(
                    direction.status_method(),
                    &SrmTokenRequest {
                        surl,
                        request_token: token,
                    },
                )
                .await?;
            if !status.return_status.is_success() {
                return Err(DigsError::Transport(format!(
                    "{}: {}",
                    direction.failure(),
                    status.return_status.describe()
                )));
            }
            if let Some(file_status) = &status.file_status {
                if !file_status.is_success() {
                    return Err(DigsError::Transport(format!(
                        "{}: {}",
                        direction.failure(),
                        file_status.describe()
                    )));
                }
            }
            if let Some(url) = status.transfer_url {
                return Ok(url);
            }
            if started.elapsed() > self.long_timeout {
                return Err(DigsError::Timeout(format!(
                    "SRM {} never issued a transfer URL for {}",
                    self.node_name, surl
                )));
            }
        }
    }

    fn transfer_client(&self, transfer_url: &str) -> DigsResult<(BulkTransferClient, String)> {
        let (host, port, path) = parse_transfer_url(transfer_url)?;
        let client = BulkTransferClient::new(&host, port)
            .with_timeouts(self.long_timeout, self.short_timeout);
        Ok((client, path))
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    match endpoint.strip_prefix("httpg://") {
        Some(rest) => format!("https://{}", rest),
        None => endpoint.to_string(),
    }
}

#[async_trait]
impl StorageElement for SrmAdaptor {
    async fn put_file(&self, local: &Path, remote: &str, ctx: &TransferContext) -> DigsResult<()> {
        let surl = self.surl(remote);
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| {
                DigsError::NotFound(format!("Local file {} not found: {}", local.display(), e))
            })?
            .len();

        let prepared: SrmPrepareResponse = self
            .call(
                "srmPrepareToPut",
                &SrmPrepareRequest {
                    surl: &surl,
                    expected_size: Some(size),
                },
            )
            .await?;
        let token = match (prepared.return_status.is_success(), prepared.request_token) {
            (true, Some(token)) => token,
            _ => {
                return Err(DigsError::Transport(format!(
                    "{}: {}",
                    Direction::Put.failure(),
                    prepared.return_status.describe()
                )))
            }
        };

        let transfer_url = self
            .wait_for_transfer_url(Direction::Put, &surl, &token, ctx)
            .await?;
        let (mut client, path) = self.transfer_client(&transfer_url)?;
        client.set_lock_mode(false);
        info!("SRM {} issued {} for {}", self.node_name, transfer_url, surl);
        client.put_file(local, &path, ctx).await?;

        let done: SrmDoneResponse = self
            .call(
                "srmPutDone",
                &SrmTokenRequest {
                    surl: &surl,
                    request_token: &token,
                },
            )
            .await?;
        if !done.return_status.is_success() {
            return Err(DigsError::Transport(format!(
                "{}: {}",
                Direction::Put.failure(),
                done.return_status.describe()
            )));
        }
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()> {
        let surl = self.surl(remote);
        let prepared: SrmPrepareResponse = self
            .call(
                "srmPrepareToGet",
                &SrmPrepareRequest {
                    surl: &surl,
                    expected_size: None,
                },
            )
            .await?;
        let token = match (prepared.return_status.is_success(), prepared.request_token) {
            (true, Some(token)) => token,
            _ => {
                return Err(DigsError::Transport(format!(
                    "{}: {}",
                    Direction::Get.failure(),
                    prepared.return_status.describe()
                )))
            }
        };

        let transfer_url = self
            .wait_for_transfer_url(Direction::Get, &surl, &token, ctx)
            .await?;
        let (client, path) = self.transfer_client(&transfer_url)?;
        client.get_file(&path, local, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use warp::http::{Response, StatusCode as WarpStatus};
    use warp::hyper::body::Bytes;
    use warp::path::FullPath;
    use warp::Filter;

    struct FakeSrm {
        files: Mutex<HashMap<String, Vec<u8>>>,
        polls: AtomicUsize,
        calls: Mutex<Vec<String>>,
        transfer_port: Mutex<u16>,
        fail_status: Option<&'static str>,
    }

    fn srm_reply(srm: &FakeSrm, method: &str, body: &Value) -> Value {
        srm.calls.lock().unwrap().push(method.to_string());
        let port = *srm.transfer_port.lock().unwrap();
        let ok = json!({"statusCode": "SRM_SUCCESS"});
        match method {
            "srmPrepareToPut" | "srmPrepareToGet" => {
                json!({"returnStatus": {"statusCode": "SRM_REQUEST_QUEUED"}, "requestToken": "tok-1"})
            }
            "srmStatusOfPutRequest" | "srmStatusOfGetRequest" => {
                assert_eq!(body["requestToken"], "tok-1");
                if let Some(code) = srm.fail_status {
                    return json!({
                        "returnStatus": {"statusCode": "SRM_FAILURE"},
                        "fileStatus": {"statusCode": code, "explanation": "no space left"}
                    });
                }
                if srm.polls.fetch_add(1, Ordering::SeqCst) == 0 {
                    json!({"returnStatus": {"statusCode": "SRM_REQUEST_INPROGRESS"}})
                } else {
                    json!({
                        "returnStatus": ok,
                        "fileStatus": {"statusCode": "SRM_SPACE_AVAILABLE"},
                        "transferUrl": format!("gsiftp://127.0.0.1:{}/pnfs/data/file1", port)
                    })
                }
            }
            "srmPutDone" => json!({"returnStatus": ok}),
            _ => json!({"returnStatus": {"statusCode": "SRM_NOT_SUPPORTED"}}),
        }
    }

    fn spawn_srm(srm: Arc<FakeSrm>) -> u16 {
        let srm_calls = srm.clone();
        let control = warp::post()
            .and(warp::path("srm"))
            .and(warp::path::param::<String>())
            .and(warp::body::json())
            .map(move |method: String, body: Value| warp::reply::json(&srm_reply(&srm_calls, &method, &body)));

        let store = srm.clone();
        let data = warp::method()
            .and(warp::path::full())
            .and(warp::body::bytes())
            .map(move |method: warp::http::Method, path: FullPath, body: Bytes| {
                let mut files = store.files.lock().unwrap();
                let key = path.as_str().to_string();
                match method.as_str() {
                    "PUT" => {
                        files.insert(key, body.to_vec());
                        Response::builder().status(WarpStatus::CREATED).body(Vec::new()).unwrap()
                    }
                    _ => match files.get(&key) {
                        Some(d) => Response::builder().status(WarpStatus::OK).body(d.clone()).unwrap(),
                        None => Response::builder().status(WarpStatus::NOT_FOUND).body(Vec::new()).unwrap(),
                    },
                }
            });

        let (addr, server) = warp::serve(control.or(data)).bind_ephemeral(([127, 0, 0, 1], 0));
        *srm.transfer_port.lock().unwrap() = addr.port();
        tokio::spawn(server);
        addr.port()
    }

    fn srm_node(port: u16) -> StorageNode {
        let mut node = StorageNode::new("beta.liv.ac.uk");
        node.path = "/pnfs".to_string();
        node.site = "liverpool".to_string();
        node.properties
            .insert("endpoint".to_string(), format!("http://127.0.0.1:{}/srm/", port));
        node
    }

    fn fake_srm(fail_status: Option<&'static str>) -> Arc<FakeSrm> {
        Arc::new(FakeSrm {
            files: Mutex::new(HashMap::new()),
            polls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            transfer_port: Mutex::new(0),
            fail_status,
        })
    }

    #[test]
    fn test_parse_transfer_url() {
        assert_eq!(
            parse_transfer_url("gsiftp://se.example:2812/pnfs/x").unwrap(),
            ("se.example".to_string(), 2812, "/pnfs/x".to_string())
        );
        assert_eq!(
            parse_transfer_url("gsiftp://se.example/pnfs/x").unwrap().1,
            DEFAULT_BULK_TRANSFER_PORT
        );
        let err = parse_transfer_url("https://se.example/pnfs/x").unwrap_err();
        assert!(err.to_string().contains("non-gsiftp URL"));
    }

    #[test]
    fn test_status_codes() {
        let ok = SrmReturnStatus {
            status_code: "SRM_FILE_PINNED".to_string(),
            explanation: None,
        };
        assert!(ok.is_success());
        let bad = SrmReturnStatus {
            status_code: "SRM_NO_FREE_SPACE".to_string(),
            explanation: Some("pool full".to_string()),
        };
        assert!(!bad.is_success());
        assert_eq!(bad.describe(), "SRM_NO_FREE_SPACE: pool full");
        assert_eq!(normalize_endpoint("httpg://srm:8443/srm/"), "https://srm:8443/srm");
    }

    #[tokio::test]
    async fn test_put_then_get_through_srm() {
        let srm = fake_srm(None);
        let port = spawn_srm(srm.clone());
        let adaptor = SrmAdaptor::for_node(&srm_node(port))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(adaptor.surl("/pnfs/x"), "srm://beta.liv.ac.uk/pnfs/x");

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("in.dat");
        tokio::fs::write(&src, b"lattice configuration").await.unwrap();
        adaptor
            .put_file(&src, "/pnfs/inbox/cfg", &TransferContext::new())
            .await
            .unwrap();
        // lock mode is off, so the bytes land directly under the issued path
        assert_eq!(
            srm.files.lock().unwrap().get("/pnfs/data/file1").unwrap(),
            b"lattice configuration"
        );
        assert_eq!(
            srm.calls.lock().unwrap().clone(),
            vec![
                "srmPrepareToPut",
                "srmStatusOfPutRequest",
                "srmStatusOfPutRequest",
                "srmPutDone"
            ]
        );

        let dst = tmp.path().join("out.dat");
        adaptor
            .get_file("/pnfs/inbox/cfg", &dst, &TransferContext::new())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"lattice configuration");
    }

    #[tokio::test]
    async fn test_terminal_status_aborts_with_explanation() {
        let srm = fake_srm(Some("SRM_NO_FREE_SPACE"));
        let port = spawn_srm(srm.clone());
        let adaptor = SrmAdaptor::for_node(&srm_node(port))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("out.dat");
        let err = adaptor
            .get_file("/pnfs/x", &dst, &TransferContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Error getting file from SRM"));
        assert!(err.to_string().contains("SRM_FAILURE"));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_transfer_url() {
        let srm = fake_srm(None);
        let port = spawn_srm(srm.clone());
        let adaptor = SrmAdaptor::for_node(&srm_node(port))
            .unwrap()
            .with_poll_interval(Duration::from_secs(30));
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("in.dat");
        tokio::fs::write(&src, b"lattice configuration").await.unwrap();

        let ctx = TransferContext::new();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            adaptor.put_file(&src, "/pnfs/inbox/cfg", &ctx),
        )
        .await
        .expect("cancellation should end the poll wait")
        .unwrap_err();
        assert!(err.is_cancelled(), "{:?}", err);
        assert_eq!(srm.calls.lock().unwrap().clone(), vec!["srmPrepareToPut"]);
        assert!(srm.files.lock().unwrap().is_empty());
    }
}
