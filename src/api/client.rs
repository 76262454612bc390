//! Atlas Admin API client: alerts, events, and log downloads over reqwest

use super::{ApiRecord, AtlasApi, Page, PageRequest, PollTarget};
use crate::checkpoint::Cursor;
use crate::config::ApiConfig;
use crate::error::{IngestError, Result};
use crate::types::Surface;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Versioned media type required by the Admin API v2
const ACCEPT_JSON: &str = "application/vnd.atlas.2023-01-01+json";
const ACCEPT_GZIP: &str = "application/vnd.atlas.2023-02-01+gzip";

/// Refresh service-account tokens this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Log window, in seconds, used when a project has never been polled
const LOG_INITIAL_LOOKBACK_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Listing {
    results: Vec<serde_json::Value>,
    links: Vec<Link>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Link {
    rel: String,
}

impl Listing {
    fn has_next(&self) -> bool {
        self.links.iter().any(|l| l.rel == "next")
    }
}

/// HTTP implementation of [`AtlasApi`]
///
/// Authenticates with an Atlas service account (OAuth2 client credentials),
/// caches the access token and project name → id lookups.
pub struct AtlasClient {
    http: reqwest::Client,
    base_url: Url,
    token_url: String,
    client_id: String,
    client_secret: String,

    token: Mutex<Option<AccessToken>>,

    /// Project name → project (group) id
    project_ids: RwLock<HashMap<String, String>>,

    /// Project name → end of the log window of the cycle in progress
    log_windows: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AtlasClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IngestError::ConfigFile(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = Url::parse(&config.base_url).map_err(|e| {
            IngestError::ConfigFile(format!("Invalid API base URL '{}': {}", config.base_url, e))
        })?;

        Ok(Self {
            http,
            base_url,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: Mutex::new(None),
            project_ids: RwLock::new(HashMap::new()),
            log_windows: Mutex::new(HashMap::new()),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(ACCEPT, "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| transport_error("token request", e))?;
        let response = check_status(response, "token request").await?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| IngestError::PermanentApi(format!("malformed token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in = token.expires_in, "Atlas access token refreshed");
        Ok(token.access_token)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                IngestError::PermanentApi(format!("base URL '{}' cannot have a path", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn get(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
        accept: &str,
    ) -> Result<reqwest::Response> {
        let url = self.url(segments)?;
        let what = url.path().to_string();
        let token = self.access_token().await?;

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, accept)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(&what, e))?;

        check_status(response, &what).await
    }

    async fn get_listing(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Listing> {
        let response = self.get(segments, query, ACCEPT_JSON).await?;
        response
            .json()
            .await
            .map_err(|e| IngestError::PermanentApi(format!("malformed listing response: {}", e)))
    }

    async fn get_bytes(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Bytes> {
        let response = self.get(segments, query, ACCEPT_GZIP).await?;
        response
            .bytes()
            .await
            .map_err(|e| IngestError::TransientApi(format!("log download interrupted: {}", e)))
    }

    /// Resolve a project name to its id, caching the answer
    async fn project_id(&self, name: &str) -> Result<String> {
        if let Some(id) = self.project_ids.read().await.get(name) {
            return Ok(id.clone());
        }

        let response = self.get(&["groups", "byName", name], &[], ACCEPT_JSON).await?;
        let project: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IngestError::PermanentApi(format!("malformed project response: {}", e)))?;
        let id = project
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                IngestError::PermanentApi(format!("project '{}' response has no id", name))
            })?
            .to_string();

        self.project_ids
            .write()
            .await
            .insert(name.to_string(), id.clone());
        tracing::debug!(project = %name, project_id = %id, "Resolved Atlas project");
        Ok(id)
    }

    async fn fetch_alerts(&self, project: &str, request: &PageRequest<'_>) -> Result<Page> {
        let group = self.project_id(project).await?;
        let listing = self
            .get_listing(&["groups", &group, "alerts"], &page_query(request))
            .await?;

        let since = request.cursor.and_then(Cursor::as_timestamp);
        Ok(build_page(listing, since, &["updated", "created"]))
    }

    async fn fetch_events(&self, segments: &[&str], request: &PageRequest<'_>) -> Result<Page> {
        let mut query = page_query(request);
        if let Some(cursor) = request.cursor {
            query.push(("minDate", cursor.to_string()));
        }
        for event_type in request.event_types {
            query.push(("eventType", event_type.clone()));
        }

        let listing = self.get_listing(segments, &query).await?;
        let since = request.cursor.and_then(Cursor::as_timestamp);
        Ok(build_page(listing, since, &["created"]))
    }

    async fn fetch_logs(
        &self,
        project: &str,
        collect_audit_logs: bool,
        request: &PageRequest<'_>,
    ) -> Result<Page> {
        let group = self.project_id(project).await?;
        let listing = self
            .get_listing(
                &["groups", &group, "processes"],
                &[("itemsPerPage", "500".to_string())],
            )
            .await?;

        let mut hosts: Vec<(String, Option<String>)> = listing
            .results
            .iter()
            .filter_map(|process| {
                let hostname = process.get("hostname")?.as_str()?.to_string();
                let cluster = process
                    .get("userAlias")
                    .and_then(|v| v.as_str())
                    .and_then(cluster_from_alias);
                Some((hostname, cluster))
            })
            .collect();
        hosts.sort();
        hosts.dedup();

        // Every page of a cycle shares one window end so no host skips a gap
        let end = {
            let mut windows = self.log_windows.lock().await;
            if request.page_num <= 1 {
                windows.insert(project.to_string(), Utc::now());
            }
            *windows.entry(project.to_string()).or_insert_with(Utc::now)
        };
        let start = request
            .cursor
            .and_then(Cursor::as_timestamp)
            .unwrap_or(end - chrono::Duration::seconds(LOG_INITIAL_LOOKBACK_SECS));

        let index = request.page_num.saturating_sub(1) as usize;
        let Some((hostname, cluster)) = hosts.get(index) else {
            return Ok(Page {
                records: Vec::new(),
                has_next: false,
                cursor: Some(Cursor::from_timestamp(end)),
            });
        };

        let mut log_names = vec!["mongodb"];
        if collect_audit_logs {
            log_names.push("mongodb-audit-log");
        }

        let mut records = Vec::new();
        for log_name in log_names {
            let file = format!("{}.gz", log_name);
            let bytes = self
                .get_bytes(
                    &["groups", &group, "clusters", hostname, "logs", &file],
                    &[
                        ("startDate", start.timestamp().to_string()),
                        ("endDate", end.timestamp().to_string()),
                    ],
                )
                .await?;

            for line in decompress_lines(&bytes)? {
                let entry = serde_json::from_str::<serde_json::Value>(&line)
                    .unwrap_or_else(|_| serde_json::json!({ "message": line }));
                records.push(ApiRecord {
                    cluster: cluster.clone(),
                    event_type: Some(log_name.to_string()),
                    payload: serde_json::json!({
                        "hostname": hostname,
                        "logName": log_name,
                        "entry": entry,
                    }),
                });
            }
        }

        Ok(Page {
            records,
            has_next: index + 1 < hosts.len(),
            cursor: Some(Cursor::from_timestamp(end)),
        })
    }
}

#[async_trait]
impl AtlasApi for AtlasClient {
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Page> {
        match request.target {
            PollTarget::Project {
                surface: Surface::Alerts,
                name,
                ..
            } => self.fetch_alerts(name, &request).await,
            PollTarget::Project {
                surface: Surface::Events,
                name,
                ..
            } => {
                let group = self.project_id(name).await?;
                self.fetch_events(&["groups", &group, "events"], &request)
                    .await
            }
            PollTarget::Project {
                surface: Surface::Logs,
                name,
                collect_audit_logs,
            } => self.fetch_logs(name, *collect_audit_logs, &request).await,
            PollTarget::Organization { id } => {
                self.fetch_events(&["orgs", id, "events"], &request).await
            }
        }
    }
}

fn page_query(request: &PageRequest<'_>) -> Vec<(&'static str, String)> {
    vec![
        ("pageNum", request.page_num.to_string()),
        ("itemsPerPage", request.page_size.to_string()),
    ]
}

/// Keep records newer than `since`; the page cursor is the newest timestamp
fn build_page(listing: Listing, since: Option<DateTime<Utc>>, time_fields: &[&str]) -> Page {
    let has_next = listing.has_next();
    let mut newest: Option<DateTime<Utc>> = None;
    let mut records = Vec::with_capacity(listing.results.len());

    for result in listing.results {
        let ts = record_time(&result, time_fields);
        if let (Some(ts), Some(since)) = (ts, since) {
            if ts <= since {
                continue;
            }
        }
        if let Some(ts) = ts {
            newest = Some(newest.map_or(ts, |n| n.max(ts)));
        }
        records.push(ApiRecord::from_json(result));
    }

    Page {
        records,
        has_next,
        cursor: newest.map(Cursor::from_timestamp),
    }
}

fn record_time(record: &serde_json::Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    fields.iter().find_map(|field| {
        let raw = record.get(*field)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    })
}

/// `cluster0-shard-00-01.abcde.mongodb.net` → `cluster0`
fn cluster_from_alias(alias: &str) -> Option<String> {
    let host = alias.split('.').next()?;
    let cluster = match host.find("-shard-") {
        Some(idx) => &host[..idx],
        None => host,
    };
    (!cluster.is_empty()).then(|| cluster.to_string())
}

fn decompress_lines(bytes: &[u8]) -> Result<Vec<String>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut raw = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| IngestError::PermanentApi(format!("malformed log archive: {}", e)))?;

    // Invalid UTF-8 in a line becomes U+FFFD rather than failing the page
    Ok(raw
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .map(String::from_utf8_lossy)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.into_owned())
        .collect())
}

fn transport_error(what: &str, e: reqwest::Error) -> IngestError {
    if e.is_builder() || e.is_decode() {
        IngestError::PermanentApi(format!("{}: {}", what, e))
    } else {
        IngestError::TransientApi(format!("{}: {}", what, e))
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(IngestError::TransientApi(message))
    } else {
        Err(IngestError::PermanentApi(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_server() -> (MockServer, AtlasClient) {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/byName/proj1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "g1"})),
            )
            .mount(&server)
            .await;

        let config = ApiConfig {
            base_url: format!("{}/api/atlas/v2", server.uri()),
            token_url: format!("{}/api/oauth/token", server.uri()),
            client_id: "id".into(),
            client_secret: "secret".into(),
            request_timeout: Duration::from_secs(5),
        };
        let client = AtlasClient::new(&config).unwrap();
        (server, client)
    }

    fn request<'a>(target: &'a PollTarget, cursor: Option<&'a Cursor>) -> PageRequest<'a> {
        PageRequest {
            target,
            cursor,
            page_num: 1,
            page_size: 100,
            event_types: &[],
        }
    }

    #[tokio::test]
    async fn test_fetch_alerts_page() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/alerts"))
            .and(query_param("pageNum", "1"))
            .and(query_param("itemsPerPage", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"id": "a1", "clusterName": "clusterA", "updated": "2024-01-01T10:00:00Z"},
                    {"id": "a2", "clusterName": "clusterB", "updated": "2024-01-01T09:00:00Z"},
                    {"id": "a3", "clusterName": "clusterB", "updated": "2023-12-31T00:00:00Z"}
                ],
                "links": [{"rel": "self"}, {"rel": "next"}],
                "totalCount": 250
            })))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Alerts, "proj1");
        let cursor = Cursor::new("2024-01-01T00:00:00.000Z");
        let page = client.fetch_page(request(&target, Some(&cursor))).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].cluster.as_deref(), Some("clusterA"));
        assert!(page.has_next);
        assert_eq!(
            page.cursor.unwrap().as_str(),
            "2024-01-01T10:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn test_fetch_org_events_passes_cursor_and_types() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/orgs/o1/events"))
            .and(query_param("minDate", "2024-01-01T00:00:00.000Z"))
            .and(query_param("eventType", "USER_JOINED_ORG"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"id": "e1", "eventTypeName": "USER_JOINED_ORG", "created": "2024-01-02T00:00:00Z"}
                ],
                "links": []
            })))
            .mount(&server)
            .await;

        let target = PollTarget::organization("o1");
        let cursor = Cursor::new("2024-01-01T00:00:00.000Z");
        let types = vec!["USER_JOINED_ORG".to_string()];
        let page = client
            .fetch_page(PageRequest {
                event_types: &types,
                ..request(&target, Some(&cursor))
            })
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].event_type.as_deref(), Some("USER_JOINED_ORG"));
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/alerts"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Alerts, "proj1");
        let err = client.fetch_page(request(&target, None)).await.unwrap_err();
        assert!(matches!(err, IngestError::TransientApi(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/alerts"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Alerts, "proj1");
        let err = client.fetch_page(request(&target, None)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unauthorized_is_permanent() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/alerts"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Alerts, "proj1");
        let err = client.fetch_page(request(&target, None)).await.unwrap_err();
        assert!(matches!(err, IngestError::PermanentApi(ref msg) if msg.contains("401")));
    }

    #[tokio::test]
    async fn test_malformed_listing_is_permanent() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Alerts, "proj1");
        let err = client.fetch_page(request(&target, None)).await.unwrap_err();
        assert!(matches!(err, IngestError::PermanentApi(_)));
    }

    #[tokio::test]
    async fn test_fetch_logs_one_host_per_page() {
        let (server, client) = mock_server().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/groups/g1/processes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"hostname": "h2.mongodb.net", "userAlias": "clusterB-shard-00-00.x.mongodb.net"},
                    {"hostname": "h1.mongodb.net", "userAlias": "clusterA-shard-00-00.x.mongodb.net"}
                ]
            })))
            .mount(&server)
            .await;

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"{\"msg\":\"connection accepted\"}\nplain text line\n")
            .unwrap();
        let archive = gz.finish().unwrap();
        Mock::given(method("GET"))
            .and(path(
                "/api/atlas/v2/groups/g1/clusters/h1.mongodb.net/logs/mongodb.gz",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
            .mount(&server)
            .await;

        let target = PollTarget::project(Surface::Logs, "proj1");
        let page = client.fetch_page(request(&target, None)).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].cluster.as_deref(), Some("clusterA"));
        assert_eq!(page.records[0].payload["entry"]["msg"], "connection accepted");
        assert_eq!(page.records[1].payload["entry"]["message"], "plain text line");
        assert!(page.has_next);
        assert!(page.cursor.is_some());
    }

    #[test]
    fn test_cluster_from_alias() {
        assert_eq!(
            cluster_from_alias("cluster0-shard-00-01.abcde.mongodb.net").as_deref(),
            Some("cluster0")
        );
        assert_eq!(cluster_from_alias("standalone.example").as_deref(), Some("standalone"));
        assert_eq!(cluster_from_alias(""), None);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_lines(b"not gzip").is_err());
        assert!(decompress_lines(b"").unwrap().is_empty());
    }

    #[test]
    fn test_decompress_keeps_lines_with_invalid_utf8() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"{\"msg\":\"ok\"}\r\nbad \xff\xfe bytes\n\n{\"msg\":\"after\"}\n")
            .unwrap();
        let lines = decompress_lines(&gz.finish().unwrap()).unwrap();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], r#"{"msg":"ok"}"#);
        assert_eq!(lines[1], "bad \u{fffd}\u{fffd} bytes");
        assert_eq!(lines[2], r#"{"msg":"after"}"#);
    }
}
