//! HTTP/JSON transport to a search cluster.
//!
//! One short-lived hyper http1 connection per request, optionally wrapped in
//! rustls, with basic auth and a hard per-request timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use tidemark_core::StorageCluster;

use crate::client::SearchClient;
use crate::error::{ClientError, ClientResult};
use crate::tls;
use crate::types::{
    AliasAction, ClusterHealth, HealthColor, IndexHealth, IndexStats, SnapshotInfo, SnapshotState,
};

/// Client for one cluster over HTTP/JSON.
pub struct HttpSearchClient {
    cluster_id: u32,
    address: String,
    host: String,
    authorization: Option<String>,
    tls: Option<TlsConnector>,
    timeout: Duration,
}

impl HttpSearchClient {
    pub fn new(cluster: &StorageCluster, timeout: Duration) -> ClientResult<Self> {
        let tls = if cluster.uses_tls() {
            Some(TlsConnector::from(tls::client_config(&cluster.tls)?))
        } else {
            None
        };
        let authorization = cluster
            .credentials()
            .map(|(user, pass)| format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))));
        Ok(Self {
            cluster_id: cluster.cluster_id,
            address: cluster.address(),
            host: cluster.domain_name.clone(),
            authorization,
            tls,
            timeout,
        })
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id
    }

    /// Send one request and return status + raw body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ClientResult<(StatusCode, Bytes)> {
        let payload = match body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|e| ClientError::Request(e.to_string()))?,
            ),
            None => Bytes::new(),
        };
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, self.address.as_str())
            .header(USER_AGENT, "tidemark/0.1")
            .header(CONTENT_TYPE, "application/json");
        if let Some(auth) = &self.authorization {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ClientError::Request(e.to_string()))?;

        let exchange = async {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|e| ClientError::Connect {
                    address: self.address.clone(),
                    message: e.to_string(),
                })?;
            match &self.tls {
                Some(connector) => {
                    let server_name = ServerName::try_from(self.host.clone())
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                    let stream = connector
                        .connect(server_name, stream)
                        .await
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                    round_trip(TokioIo::new(stream), request).await
                }
                None => round_trip(TokioIo::new(stream), request).await,
            }
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!(cluster_id = self.cluster_id, %method, %path, status = status.as_u16(), "cluster call");
        Ok((status, bytes))
    }

    /// Send and decode a JSON response; 404 maps to `NotFound`.
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> ClientResult<Value> {
        let (status, bytes) = self.send(method.clone(), path, body).await?;
        if status.is_success() {
            return decode(&bytes);
        }
        Err(status_error(&method, path, status, &bytes))
    }

    /// Like `call`, but a 404 body is still decoded (partial alias hits).
    async fn call_lenient(&self, path: &str) -> ClientResult<Value> {
        let (status, bytes) = self.send(Method::GET, path, None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return decode(&bytes);
        }
        Err(status_error(&Method::GET, path, status, &bytes))
    }
}

async fn round_trip<I>(io: I, request: Request<Full<Bytes>>) -> ClientResult<(StatusCode, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ClientError::Http(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "cluster connection closed with error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ClientError::Http(e.to_string()))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ClientError::Http(e.to_string()))?
        .to_bytes();
    Ok((status, body))
}

fn decode(bytes: &Bytes) -> ClientResult<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

fn status_error(method: &Method, path: &str, status: StatusCode, bytes: &Bytes) -> ClientError {
    let body = String::from_utf8_lossy(bytes).into_owned();
    if status == StatusCode::NOT_FOUND {
        return ClientError::NotFound(path.to_string());
    }
    if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
        return ClientError::AlreadyExists(path.to_string());
    }
    ClientError::Status {
        method: method.to_string(),
        path: path.to_string(),
        status: status.as_u16(),
        body,
    }
}

fn u32_at(value: &Value, key: &str) -> u32 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

fn parse_health(value: &Value) -> ClientResult<ClusterHealth> {
    let color = |v: &Value| {
        v.get("status")
            .and_then(Value::as_str)
            .and_then(HealthColor::parse)
            .ok_or_else(|| ClientError::Decode(format!("health status missing in {v}")))
    };
    let mut indices = BTreeMap::new();
    if let Some(map) = value.get("indices").and_then(Value::as_object) {
        for (name, entry) in map {
            indices.insert(
                name.clone(),
                IndexHealth {
                    status: color(entry)?,
                    number_of_shards: u32_at(entry, "number_of_shards"),
                    number_of_replicas: u32_at(entry, "number_of_replicas"),
                    active_shards: u32_at(entry, "active_shards"),
                    unassigned_shards: u32_at(entry, "unassigned_shards"),
                },
            );
        }
    }
    Ok(ClusterHealth {
        status: color(value)?,
        indices,
    })
}

fn parse_stats(value: &Value) -> BTreeMap<String, IndexStats> {
    let mut out = BTreeMap::new();
    if let Some(map) = value.get("indices").and_then(Value::as_object) {
        for (name, entry) in map {
            let primaries = &entry["primaries"];
            out.insert(
                name.clone(),
                IndexStats {
                    size_in_bytes: primaries["store"]["size_in_bytes"].as_u64().unwrap_or(0),
                    doc_count: primaries["docs"]["count"].as_u64().unwrap_or(0),
                },
            );
        }
    }
    out
}

fn parse_aliases(value: &Value) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    if let Some(map) = value.as_object() {
        for (index, entry) in map {
            // A partial 404 carries `error` / `status` next to the hits.
            let Some(aliases) = entry.get("aliases").and_then(Value::as_object) else {
                continue;
            };
            out.insert(index.clone(), aliases.keys().cloned().collect());
        }
    }
    out
}

fn parse_snapshots(value: &Value) -> Vec<SnapshotInfo> {
    value
        .get("snapshots")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    Some(SnapshotInfo {
                        snapshot: entry.get("snapshot")?.as_str()?.to_string(),
                        state: entry
                            .get("state")
                            .and_then(Value::as_str)
                            .and_then(SnapshotState::parse)
                            .unwrap_or(SnapshotState::InProgress),
                        indices: entry
                            .get("indices")
                            .and_then(Value::as_array)
                            .map(|a| a.iter().filter_map(|i| i.as_str().map(String::from)).collect())
                            .unwrap_or_default(),
                        start_time_in_millis: entry.get("start_time_in_millis").and_then(Value::as_i64),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn cluster_health(&self, index: Option<&str>) -> ClientResult<ClusterHealth> {
        let path = match index {
            Some(index) => format!("/_cluster/health/{index}?level=indices"),
            None => "/_cluster/health?level=indices".to_string(),
        };
        let value = match self.call(Method::GET, &path, None).await {
            Ok(value) => value,
            // A missing index reports 408 with a red body.
            Err(ClientError::Status { status: 408, body, .. }) => serde_json::from_str(&body)
                .map_err(|e| ClientError::Decode(e.to_string()))?,
            Err(e) => return Err(e),
        };
        parse_health(&value)
    }

    async fn get_cluster_settings(&self) -> ClientResult<Value> {
        let value = self.call(Method::GET, "/_cluster/settings", None).await?;
        Ok(value.get("persistent").cloned().unwrap_or_else(|| json!({})))
    }

    async fn put_cluster_settings(&self, body: &Value) -> ClientResult<()> {
        self.call(Method::PUT, "/_cluster/settings", Some(body))
            .await
            .map(|_| ())
    }

    async fn create_index(&self, index: &str, body: &Value) -> ClientResult<()> {
        self.call(Method::PUT, &format!("/{index}"), Some(body))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ClientError::AlreadyExists(_) => ClientError::AlreadyExists(index.to_string()),
                other => other,
            })
    }

    async fn index_exists(&self, index: &str) -> ClientResult<bool> {
        let path = format!("/{index}");
        let (status, bytes) = self.send(Method::HEAD, &path, None).await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(&Method::HEAD, &path, s, &bytes)),
        }
    }

    async fn delete_index(&self, index: &str) -> ClientResult<()> {
        self.call(Method::DELETE, &format!("/{index}"), None)
            .await
            .map(|_| ())
    }

    async fn indices_stats(&self, pattern: &str) -> ClientResult<BTreeMap<String, IndexStats>> {
        match self
            .call(Method::GET, &format!("/{pattern}/_stats/store,docs"), None)
            .await
        {
            Ok(value) => Ok(parse_stats(&value)),
            Err(ClientError::NotFound(_)) => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_alias(
        &self,
        index_pattern: &str,
        alias: Option<&str>,
    ) -> ClientResult<BTreeMap<String, Vec<String>>> {
        let path = match alias {
            Some(alias) => format!("/{index_pattern}/_alias/{alias}"),
            None => format!("/{index_pattern}/_alias"),
        };
        let value = self.call_lenient(&path).await?;
        Ok(parse_aliases(&value))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> ClientResult<()> {
        let body = json!({
            "actions": actions.iter().map(AliasAction::to_json).collect::<Vec<_>>(),
        });
        self.call(Method::POST, "/_aliases", Some(&body))
            .await
            .map(|_| ())
    }

    async fn delete_alias(&self, index: &str, aliases: &[String]) -> ClientResult<()> {
        if aliases.is_empty() {
            return Ok(());
        }
        self.call(
            Method::DELETE,
            &format!("/{index}/_alias/{}", aliases.join(",")),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn get_mapping(&self, index: &str) -> ClientResult<Option<Value>> {
        match self.call(Method::GET, &format!("/{index}/_mapping"), None).await {
            Ok(value) => Ok(value
                .get(index)
                .and_then(|entry| entry.get("mappings"))
                .cloned()),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_mapping(&self, indices: &[String], body: &Value) -> ClientResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        self.call(
            Method::PUT,
            &format!("/{}/_mapping", indices.join(",")),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn get_settings(
        &self,
        index_pattern: &str,
    ) -> ClientResult<BTreeMap<String, Map<String, Value>>> {
        let value = match self
            .call(
                Method::GET,
                &format!("/{index_pattern}/_settings?flat_settings=true"),
                None,
            )
            .await
        {
            Ok(value) => value,
            Err(ClientError::NotFound(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let mut out = BTreeMap::new();
        if let Some(map) = value.as_object() {
            for (index, entry) in map {
                let settings = entry
                    .get("settings")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                out.insert(index.clone(), settings);
            }
        }
        Ok(out)
    }

    async fn put_settings(&self, indices: &[String], body: &Value) -> ClientResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        self.call(
            Method::PUT,
            &format!("/{}/_settings", indices.join(",")),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn count(&self, index: &str) -> ClientResult<u64> {
        let value = self
            .call(Method::GET, &format!("/{index}/_count"), None)
            .await?;
        value
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Decode(format!("count missing for {index}")))
    }

    async fn edge_document_time(
        &self,
        index: &str,
        field: &str,
        newest: bool,
    ) -> ClientResult<Option<i64>> {
        let order = if newest { "desc" } else { "asc" };
        let body = json!({
            "size": 1,
            "_source": [field],
            "sort": [{ field: { "order": order } }],
        });
        let value = self
            .call(Method::POST, &format!("/{index}/_search"), Some(&body))
            .await?;
        Ok(value["hits"]["hits"]
            .get(0)
            .and_then(|hit| hit["_source"].get(field))
            .and_then(epoch_millis))
    }

    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        indices: &[String],
    ) -> ClientResult<()> {
        let body = json!({
            "indices": indices.join(","),
            "include_global_state": false,
        });
        self.call(
            Method::PUT,
            &format!("/_snapshot/{repository}/{snapshot}"),
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn get_snapshots(&self, repository: &str, pattern: &str) -> ClientResult<Vec<SnapshotInfo>> {
        match self
            .call(Method::GET, &format!("/_snapshot/{repository}/{pattern}"), None)
            .await
        {
            Ok(value) => Ok(parse_snapshots(&value)),
            Err(ClientError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> ClientResult<()> {
        self.call(
            Method::DELETE,
            &format!("/_snapshot/{repository}/{snapshot}"),
            None,
        )
        .await
        .map(|_| ())
    }
}
