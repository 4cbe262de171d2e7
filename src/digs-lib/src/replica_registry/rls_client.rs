use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{translate_wildcard, ReplicaRegistry};
use crate::{DigsError, DigsResult};

const MAX_STRING_LEN: usize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const RLS_SUCCESS: u32 = 0;
const RLS_MAPPING_NEXIST: u32 = 10;
const RLS_LFN_NEXIST: u32 = 12;
const RLS_ATTR_NEXIST: u32 = 23;
const RLS_ATTR_VALUE_NEXIST: u32 = 29;

pub fn rls_error_to_string(code: u32) -> &'static str {
    match code {
        0 => "OK",
        1 => "Globus I/O error",
        2 => "Invalid RLS handle",
        3 => "Bad URL",
        4 => "Out of memory",
        5 => "Result too large for buffer",
        6 => "Bad argument",
        7 => "Permission denied",
        8 => "Bad RPC method",
        9 => "Request made to wrong server (RLI or LRC)",
        10 => "Mapping does not exist",
        11 => "LFN already exists",
        12 => "LFN does not exist",
        13 => "PFN already exists",
        14 => "PFN does not exist",
        15 => "LRC already exists",
        16 => "LRC does not exist",
        17 => "Database error",
        18 => "RLI already exists",
        19 => "RLI does not exist",
        20 => "Mapping already exists",
        21 => "Invalid attribute type",
        22 => "Attribute already exists",
        23 => "Attribute does not exist",
        24 => "Invalid object type",
        25 => "Invalid attribute search operator",
        26 => "Operation unsupported",
        27 => "I/O operation timed out",
        28 => "Too many connections",
        29 => "Attribute with specified value not found",
        30 => "Attribute in use",
        _ => "unknown",
    }
}

/// One LRC session. A connection that lost its place in a reply stream is
/// marked broken and replaced before the next request.
struct RlsConnection {
    stream: BufReader<TcpStream>,
    peer: String,
    broken: bool,
}

impl RlsConnection {
    async fn open(peer: &str) -> DigsResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| DigsError::Timeout(format!("connect to RLS {} timed out", peer)))?
            .map_err(|e| DigsError::Connection(format!("connect to RLS {} failed: {}", peer, e)))?;

        let mut conn = RlsConnection {
            stream: BufReader::new(stream),
            peer: peer.to_string(),
            broken: false,
        };
        let code = conn.read_code().await?;
        if code != RLS_SUCCESS {
            return Err(DigsError::Registry(format!(
                "Error opening RLS: {}",
                rls_error_to_string(code)
            )));
        }
        info!("connected to RLS {}", peer);
        Ok(conn)
    }

    async fn call(&mut self, method: &str, args: &[&str]) -> DigsResult<u32> {
        if self.broken {
            let peer = self.peer.clone();
            warn!("reconnecting to RLS {} after a protocol error", peer);
            *self = Self::open(&peer).await?;
        }
        let mut request = Vec::with_capacity(64);
        request.extend_from_slice(method.as_bytes());
        request.push(0);
        for arg in args {
            request.extend_from_slice(arg.as_bytes());
            request.push(0);
        }
        if let Err(e) = self.stream.get_mut().write_all(&request).await {
            self.broken = true;
            return Err(DigsError::Transport(format!(
                "write to RLS {} failed: {}",
                self.peer, e
            )));
        }
        self.read_code().await
    }

    async fn read_string(&mut self) -> DigsResult<String> {
        let mut buf = Vec::new();
        loop {
            let b = match self.stream.read_u8().await {
                Ok(b) => b,
                Err(e) => {
                    self.broken = true;
                    return Err(DigsError::Transport(format!(
                        "read from RLS {} failed: {}",
                        self.peer, e
                    )));
                }
            };
            if b == 0 {
                break;
            }
            buf.push(b);
            if buf.len() >= MAX_STRING_LEN {
                self.broken = true;
                return Err(DigsError::Registry(format!(
                    "String read from RLS is > {} bytes",
                    MAX_STRING_LEN
                )));
            }
        }
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    async fn read_code(&mut self) -> DigsResult<u32> {
        let s = self.read_string().await?;
        match s.trim().parse::<u32>() {
            Ok(code) => Ok(code),
            Err(_) => {
                self.broken = true;
                Err(DigsError::Registry(format!("bad result code from RLS: {}", s)))
            }
        }
    }

    /// Error replies carry one detail string that must be consumed.
    async fn fail(&mut self, context: String, code: u32) -> DigsError {
        let _ = self.read_string().await;
        DigsError::Registry(format!("{}: {}", context, rls_error_to_string(code)))
    }

    async fn read_pairs(&mut self) -> DigsResult<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        loop {
            let first = self.read_string().await?;
            if first.is_empty() {
                break;
            }
            let second = self.read_string().await?;
            pairs.push((first, second));
        }
        Ok(pairs)
    }
}

/// Client for the replica-location service's LRC interface.
///
/// Requests and replies are NUL-terminated strings; every reply starts with
/// a decimal result code. Calls on one client are serialised.
pub struct RlsClient {
    conn: Mutex<RlsConnection>,
}

impl RlsClient {
    pub async fn connect(host: &str, port: u16) -> DigsResult<Self> {
        let conn = RlsConnection::open(&format!("{}:{}", host, port)).await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ReplicaRegistry for RlsClient {
    async fn get_file_locations(&self, lfn: &str) -> DigsResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_get_pfn", &[lfn, "0", "0"]).await?;
        if code == RLS_LFN_NEXIST {
            let _ = conn.read_string().await?;
            return Err(DigsError::NotFound(format!("File {} does not exist on grid", lfn)));
        }
        if code != RLS_SUCCESS {
            return Err(conn
                .fail(format!("Error getting file locations for {} from RLS", lfn), code)
                .await);
        }
        Ok(conn.read_pairs().await?.into_iter().map(|(_, pfn)| pfn).collect())
    }

    async fn get_attribute(&self, lfn: &str, attr: &str) -> DigsResult<Option<String>> {
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_attr_value_get", &[lfn, attr, "0"]).await?;
        match code {
            RLS_SUCCESS => {
                let _name = conn.read_string().await?;
                let _kind = conn.read_string().await?;
                let value = conn.read_string().await?;
                let _end = conn.read_string().await?;
                Ok(Some(value))
            }
            RLS_ATTR_NEXIST => {
                let _ = conn.read_string().await?;
                Ok(None)
            }
            RLS_LFN_NEXIST => {
                let _ = conn.read_string().await?;
                Err(DigsError::NotFound(format!(
                    "Error getting attribute {} for {} from RLS: LFN doesn't exist",
                    attr, lfn
                )))
            }
            _ => Err(conn
                .fail(format!("Error getting attribute {} for {} from RLS", attr, lfn), code)
                .await),
        }
    }

    async fn get_all_attribute_values(&self, attr: &str) -> DigsResult<HashMap<String, String>> {
        let mut conn = self.conn.lock().await;
        let code = conn
            .call("lrc_attr_search", &[attr, "0", "0", "", "", "0", "0"])
            .await?;
        if code == RLS_ATTR_NEXIST || code == RLS_ATTR_VALUE_NEXIST {
            let _ = conn.read_string().await?;
            return Ok(HashMap::new());
        }
        if code != RLS_SUCCESS {
            return Err(conn
                .fail(format!("Error getting all values for {} from RLS", attr), code)
                .await);
        }

        let mut values = HashMap::new();
        loop {
            let lfn = conn.read_string().await?;
            if lfn.is_empty() {
                break;
            }
            let kind = conn.read_string().await?;
            if kind.is_empty() {
                break;
            }
            let value = conn.read_string().await?;
            values.insert(lfn, value);
        }
        Ok(values)
    }

    async fn get_file_list(&self, wildcard: &str) -> DigsResult<BTreeMap<String, Vec<String>>> {
        let pattern = translate_wildcard(wildcard);
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_get_pfn_wc", &[&pattern, "0", "0"]).await?;
        if code == RLS_LFN_NEXIST {
            let _ = conn.read_string().await?;
            return Ok(BTreeMap::new());
        }
        if code != RLS_SUCCESS {
            return Err(conn
                .fail(format!("Error getting file locations for {} from RLS", wildcard), code)
                .await);
        }

        let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (lfn, pfn) in conn.read_pairs().await? {
            files.entry(lfn).or_default().push(pfn);
        }
        Ok(files)
    }

    async fn lfn_exists(&self, lfn: &str) -> DigsResult<bool> {
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_get_pfn", &[lfn, "0", "0"]).await?;
        if code == RLS_LFN_NEXIST {
            let _ = conn.read_string().await?;
            return Ok(false);
        }
        if code != RLS_SUCCESS {
            return Err(conn
                .fail(format!("Error getting file locations for {} from RLS", lfn), code)
                .await);
        }
        let _ = conn.read_pairs().await?;
        Ok(true)
    }

    async fn file_at_location(&self, lfn: &str, node: &str) -> DigsResult<bool> {
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_mapping_exists", &[lfn, node]).await?;
        if code == RLS_MAPPING_NEXIST {
            let _ = conn.read_string().await?;
            return Ok(false);
        }
        if code != RLS_SUCCESS {
            return Err(conn
                .fail("Error getting RLS mapping existence".to_string(), code)
                .await);
        }
        let _ = conn.read_string().await?;
        Ok(true)
    }

    async fn list_location_files(&self, node: &str) -> DigsResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let code = conn.call("lrc_get_lfn", &[node, "0", "0"]).await?;
        if code != RLS_SUCCESS {
            return Err(conn
                .fail(format!("Error listing lfns at {}", node), code)
                .await);
        }
        Ok(conn.read_pairs().await?.into_iter().map(|(lfn, _)| lfn).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Each exchange: the request strings the server expects, then its reply strings.
    type Exchange = (Vec<&'static str>, Vec<&'static str>);

    async fn read_nul_string(stream: &mut BufReader<TcpStream>) -> String {
        let mut buf = Vec::new();
        loop {
            let b = stream.read_u8().await.unwrap();
            if b == 0 {
                break;
            }
            buf.push(b);
        }
        String::from_utf8(buf).unwrap()
    }

    fn encode(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    /// Serves one script per accepted connection, in order.
    async fn spawn_rls_sessions(sessions: Vec<Vec<Exchange>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for script in sessions {
                let (sock, _) = listener.accept().await.unwrap();
                let mut stream = BufReader::new(sock);
                stream.get_mut().write_all(&encode(&["0"])).await.unwrap();
                for (expected, reply) in script {
                    for want in expected {
                        let got = read_nul_string(&mut stream).await;
                        assert_eq!(got, want);
                    }
                    stream.get_mut().write_all(&encode(&reply)).await.unwrap();
                }
            }
        });
        port
    }

    async fn spawn_rls(script: Vec<Exchange>) -> u16 {
        spawn_rls_sessions(vec![script]).await
    }

    #[tokio::test]
    async fn test_locations_and_existence() {
        let port = spawn_rls(vec![
            (
                vec!["lrc_get_pfn", "ens/cfg1", "0", "0"],
                vec!["0", "ens/cfg1", "alpha", "ens/cfg1", "beta", ""],
            ),
            (vec!["lrc_get_pfn", "missing", "0", "0"], vec!["12", "missing"]),
            (
                vec!["lrc_get_pfn", "ens/cfg1", "0", "0"],
                vec!["0", "ens/cfg1", "alpha", ""],
            ),
            (vec!["lrc_mapping_exists", "ens/cfg1", "gamma"], vec!["10", "x"]),
        ])
        .await;

        let client = RlsClient::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(
            client.get_file_locations("ens/cfg1").await.unwrap(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
        assert!(!client.lfn_exists("missing").await.unwrap());
        assert!(client.lfn_exists("ens/cfg1").await.unwrap());
        assert!(!client.file_at_location("ens/cfg1", "gamma").await.unwrap());
    }

    #[tokio::test]
    async fn test_attribute_codes() {
        let port = spawn_rls(vec![
            (
                vec!["lrc_attr_value_get", "ens/cfg1", "lockedby", "0"],
                vec!["0", "lockedby", "3", "/C=UK/CN=alice", ""],
            ),
            (
                vec!["lrc_attr_value_get", "ens/cfg1", "replcount", "0"],
                vec!["23", "replcount"],
            ),
            (
                vec!["lrc_attr_value_get", "nope", "size", "0"],
                vec!["12", "nope"],
            ),
            (
                vec!["lrc_attr_value_get", "ens/cfg1", "alpha-dir", "0"],
                vec!["0", "alpha-dir", "3", "data3", ""],
            ),
            (
                vec!["lrc_attr_value_get", "ens/cfg1", "size", "0"],
                vec!["7", "denied"],
            ),
        ])
        .await;

        let client = RlsClient::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(
            client.get_attribute("ens/cfg1", "lockedby").await.unwrap().as_deref(),
            Some("/C=UK/CN=alice")
        );
        assert_eq!(client.get_attribute("ens/cfg1", "replcount").await.unwrap(), None);
        assert!(client.get_attribute("nope", "size").await.unwrap_err().is_not_found());
        assert_eq!(
            client.get_file_disk("ens/cfg1", "alpha").await.unwrap().as_deref(),
            Some("data3")
        );
        let err = client.get_attribute("ens/cfg1", "size").await.unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_bulk_queries() {
        let port = spawn_rls(vec![
            (
                vec!["lrc_attr_search", "size", "0", "0", "", "", "0", "0"],
                vec!["0", "a/x", "0", "100", "a/y", "0", "200", ""],
            ),
            (
                vec!["lrc_attr_search", "lockedby", "0", "0", "", "", "0", "0"],
                vec!["29", "lockedby"],
            ),
            (
                vec!["lrc_get_pfn_wc", "a/%", "0", "0"],
                vec!["0", "a/x", "alpha", "a/x", "beta", "a/y", "beta", ""],
            ),
            (vec!["lrc_get_pfn_wc", "b/%", "0", "0"], vec!["12", "b/%"]),
            (
                vec!["lrc_get_lfn", "beta", "0", "0"],
                vec!["0", "a/x", "beta", "a/y", "beta", ""],
            ),
        ])
        .await;

        let client = RlsClient::connect("127.0.0.1", port).await.unwrap();
        let sizes = client.get_all_attribute_values("size").await.unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.get("a/y").map(|s| s.as_str()), Some("200"));
        assert!(client.get_all_attribute_values("lockedby").await.unwrap().is_empty());

        let files = client.get_file_list("a/*").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["a/x"], vec!["alpha".to_string(), "beta".to_string()]);
        assert!(client.get_file_list("b/*").await.unwrap().is_empty());

        assert_eq!(
            client.list_location_files("beta").await.unwrap(),
            vec!["a/x".to_string(), "a/y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_open_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&encode(&["7"])).await.unwrap();
        });
        let err = RlsClient::connect("127.0.0.1", port).await.err().unwrap();
        assert!(err.to_string().contains("Error opening RLS: Permission denied"));
    }

    #[tokio::test]
    async fn test_oversized_reply_reconnects() {
        let long_value: &'static str = Box::leak("x".repeat(1200).into_boxed_str());
        let port = spawn_rls_sessions(vec![
            vec![(
                vec!["lrc_attr_value_get", "a", "comment", "0"],
                vec!["0", "comment", "3", long_value, ""],
            )],
            vec![(
                vec!["lrc_attr_value_get", "b", "size", "0"],
                vec!["0", "size", "3", "42", ""],
            )],
        ])
        .await;

        let client = RlsClient::connect("127.0.0.1", port).await.unwrap();
        let err = client.get_attribute("a", "comment").await.unwrap_err();
        assert!(err.to_string().contains("String read from RLS is > 1000 bytes"));
        assert_eq!(
            client.get_attribute("b", "size").await.unwrap().as_deref(),
            Some("42")
        );
    }
}
