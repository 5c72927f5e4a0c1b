//! OpenStack Swift object store client.
//!
//! Authenticates against Keystone v2 with tenant/user/password
//! credentials, caches the issued token plus the object-store endpoint
//! from the service catalog, and re-authenticates once when a request
//! comes back 401. Object traffic follows the same shape as the S3
//! client: ranged GET, whole-object PUT, prefix listing.

use crate::error::{ErrorKind, HelperError};
use crate::helper::{params, Params, DEFAULT_OP_TIMEOUT};
use crate::objectstore::http::{uri_encode, HttpClient, HttpRequest, HttpResponse, Scheme};
use crate::objectstore::{ObjectBackend, ObjectEntry, MAX_DELETE_BATCH};
use crate::retry::{retry, RetryPolicy};
use crate::telemetry::SharedMetricsRegistry;
use log::{debug, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SwiftConfig {
    pub auth_url: String,
    pub container: String,
    pub tenant_name: String,
    pub user_name: String,
    pub password: String,
    pub ca_bundle: Option<PathBuf>,
    pub timeout: Duration,
}

impl SwiftConfig {
    /// Factory parameters: `authUrl`, `containerName`, `tenantName`,
    /// `userName`, `password` (required), `caBundlePath`, `timeout` (ms).
    pub fn from_params(params_map: &Params) -> Result<Self, HelperError> {
        Ok(Self {
            auth_url: params::required(params_map, "authUrl")?,
            container: params::required(params_map, "containerName")?,
            tenant_name: params::required(params_map, "tenantName")?,
            user_name: params::required(params_map, "userName")?,
            password: params::required(params_map, "password")?,
            ca_bundle: params::optional(params_map, "caBundlePath").map(PathBuf::from),
            timeout: params::timeout(params_map, DEFAULT_OP_TIMEOUT)?,
        })
    }
}

/// Token plus resolved object-store endpoint for one auth session.
struct SwiftSession {
    token: String,
    storage: Arc<HttpClient>,
    storage_path: String,
}

pub struct SwiftClient {
    config: SwiftConfig,
    auth_http: HttpClient,
    auth_path: String,
    session: Mutex<Option<Arc<SwiftSession>>>,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

struct SwiftFailure {
    status: Option<u16>,
    error: HelperError,
}

impl SwiftFailure {
    fn transport(error: HelperError) -> Self {
        Self {
            status: None,
            error,
        }
    }

    fn is_transient(&self) -> bool {
        match self.status {
            Some(status) => matches!(status, 429 | 498 | 500 | 502 | 503 | 504),
            None => matches!(
                self.error.kind(),
                ErrorKind::TimedOut | ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable
            ),
        }
    }
}

impl SwiftClient {
    pub fn new(config: SwiftConfig) -> Result<Self, HelperError> {
        let (auth_http, auth_path) =
            endpoint_client(&config.auth_url, config.ca_bundle.as_deref(), config.timeout)?;
        Ok(Self {
            config,
            auth_http,
            auth_path,
            session: Mutex::new(None),
            retry_policy: RetryPolicy::default(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn session(&self) -> Result<Arc<SwiftSession>, HelperError> {
        let mut slot = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = Arc::new(self.authenticate()?);
        *slot = Some(session.clone());
        Ok(session)
    }

    fn invalidate_session(&self) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = None;
        }
    }

    fn authenticate(&self) -> Result<SwiftSession, HelperError> {
        let body = serde_json::json!({
            "auth": {
                "passwordCredentials": {
                    "username": self.config.user_name,
                    "password": self.config.password,
                },
                "tenantName": self.config.tenant_name,
            }
        });
        let request = HttpRequest::new("POST", format!("{}/tokens", self.auth_path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(serde_json::to_vec(&body).map_err(|err| {
                HelperError::new(ErrorKind::IoError, format!("encode auth request: {err}"))
            })?);
        let response = self.auth_http.execute(&request)?;
        if response.status == 401 || response.status == 403 {
            return Err(HelperError::new(
                ErrorKind::PermissionDenied,
                format!(
                    "Keystone rejected credentials for tenant {} (HTTP {})",
                    self.config.tenant_name, response.status
                ),
            ));
        }
        if response.status >= 300 {
            return Err(HelperError::new(
                ErrorKind::HostUnreachable,
                format!("Keystone authentication failed with HTTP {}", response.status),
            ));
        }
        let access: KeystoneAccessEnvelope =
            serde_json::from_slice(&response.body).map_err(|err| {
                HelperError::new(
                    ErrorKind::IoError,
                    format!("malformed Keystone response: {err}"),
                )
            })?;
        let endpoint = access
            .access
            .service_catalog
            .iter()
            .find(|service| service.service_type == "object-store")
            .and_then(|service| service.endpoints.first())
            .map(|endpoint| endpoint.public_url.clone())
            .ok_or_else(|| {
                HelperError::new(
                    ErrorKind::HostUnreachable,
                    "service catalog has no object-store endpoint",
                )
            })?;
        debug!("Swift object-store endpoint resolved to {endpoint}");
        let (storage, storage_path) = endpoint_client(
            &endpoint,
            self.config.ca_bundle.as_deref(),
            self.config.timeout,
        )?;
        Ok(SwiftSession {
            token: access.access.token.id,
            storage: Arc::new(storage),
            storage_path,
        })
    }

    /// Issues one Swift request through the retry loop, re-authenticating
    /// once per attempt when the token has expired.
    fn execute(
        &self,
        operation: &'static str,
        build: impl Fn(&SwiftSession) -> HttpRequest,
    ) -> Result<HttpResponse, HelperError> {
        let result = retry(
            &self.retry_policy,
            SwiftFailure::is_transient,
            |failure: &SwiftFailure| {
                warn!(
                    "retrying Swift operation {operation} after error: {}",
                    failure.error
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_counter(&format!("swift.{operation}.retries"), 1);
                }
            },
            || {
                let session = self.session().map_err(SwiftFailure::transport)?;
                let request = build(&session).header("X-Auth-Token", session.token.clone());
                let response = session
                    .storage
                    .execute(&request)
                    .map_err(SwiftFailure::transport)?;
                if response.status == 401 {
                    // Token expired mid-session; fetch a fresh one and
                    // reissue within the same attempt.
                    self.invalidate_session();
                    let session = self.session().map_err(SwiftFailure::transport)?;
                    let request = build(&session).header("X-Auth-Token", session.token.clone());
                    let response = session
                        .storage
                        .execute(&request)
                        .map_err(SwiftFailure::transport)?;
                    return check_swift_outcome(operation, response);
                }
                check_swift_outcome(operation, response)
            },
        );
        result.map_err(|failure| failure.error)
    }

    fn object_target(&self, session: &SwiftSession, key: &str) -> String {
        format!(
            "{}/{}/{}",
            session.storage_path,
            uri_encode(&self.config.container, false),
            uri_encode(key, true)
        )
    }

    fn count_error(&self, counter: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(counter, 1);
        }
    }
}

impl ObjectBackend for SwiftClient {
    fn backend_name(&self) -> &'static str {
        "swift"
    }

    fn get_object(&self, key: &str, offset: u64, size: usize) -> Result<Vec<u8>, HelperError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.timer("swift.read"));
        let range = format!("bytes={offset}-{}", offset + size as u64 - 1);
        let result = self.execute("GetObject", |session| {
            HttpRequest::new("GET", self.object_target(session, key))
                .header("Range", range.clone())
        });
        match result {
            Ok(response) => {
                let body = response.body;
                if let Some(timer) = timer {
                    timer.stop(body.len() as u64);
                }
                Ok(body)
            }
            Err(err) if err.errno() == Some(416) => Ok(Vec::new()),
            Err(err) => {
                self.count_error("swift.errors.read");
                Err(err)
            }
        }
    }

    fn put_object(&self, key: &str, data: &[u8]) -> Result<usize, HelperError> {
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.timer("swift.write"));
        let result = self.execute("PutObject", |session| {
            HttpRequest::new("PUT", self.object_target(session, key)).body(data.to_vec())
        });
        match result {
            Ok(_) => {
                if let Some(timer) = timer {
                    timer.stop(data.len() as u64);
                }
                Ok(data.len())
            }
            Err(err) => {
                self.count_error("swift.errors.write");
                Err(err)
            }
        }
    }

    fn delete_objects(&self, keys: &[String]) -> Result<(), HelperError> {
        debug_assert!(keys.len() <= MAX_DELETE_BATCH);
        for key in keys {
            let result = self.execute("DeleteObject", |session| {
                HttpRequest::new("DELETE", self.object_target(session, key))
            });
            match result {
                Ok(_) => {}
                // Bulk deletes are quiet about already-missing objects.
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, HelperError> {
        let response = self.execute("ListObjects", |session| {
            HttpRequest::new(
                "GET",
                format!(
                    "{}/{}?format=json&prefix={}",
                    session.storage_path,
                    uri_encode(&self.config.container, false),
                    uri_encode(prefix, false)
                ),
            )
            .header("Accept", "application/json")
        });
        let response = match response {
            Ok(response) => response,
            // Listing a missing container is an empty listing.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let entries: Vec<SwiftListEntry> =
            serde_json::from_slice(&response.body).map_err(|err| {
                HelperError::new(
                    ErrorKind::IoError,
                    format!("malformed container listing: {err}"),
                )
            })?;
        Ok(entries
            .into_iter()
            .map(|entry| ObjectEntry {
                key: entry.name,
                size: entry.bytes,
            })
            .collect())
    }

    fn head_object(&self, key: &str) -> Result<ObjectEntry, HelperError> {
        let response = self.execute("HeadObject", |session| {
            HttpRequest::new("HEAD", self.object_target(session, key))
        })?;
        let size = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Ok(ObjectEntry {
            key: key.to_string(),
            size,
        })
    }
}

#[derive(Deserialize)]
struct KeystoneAccessEnvelope {
    access: KeystoneAccess,
}

#[derive(Deserialize)]
struct KeystoneAccess {
    token: KeystoneToken,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<KeystoneService>,
}

#[derive(Deserialize)]
struct KeystoneToken {
    id: String,
}

#[derive(Deserialize)]
struct KeystoneService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<KeystoneEndpoint>,
}

#[derive(Deserialize)]
struct KeystoneEndpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
}

#[derive(Deserialize)]
struct SwiftListEntry {
    name: String,
    #[serde(default)]
    bytes: u64,
}

fn check_swift_outcome(
    operation: &str,
    response: HttpResponse,
) -> Result<HttpResponse, SwiftFailure> {
    if response.status < 300 {
        return Ok(response);
    }
    let kind = match response.status {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::PermissionDenied,
        408 => ErrorKind::TimedOut,
        503 => ErrorKind::HostUnreachable,
        507 => ErrorKind::NoSpace,
        _ => ErrorKind::IoError,
    };
    Err(SwiftFailure {
        status: Some(response.status),
        error: HelperError::with_errno(
            kind,
            response.status as i32,
            format!("{operation}: HTTP {}", response.status),
        ),
    })
}

/// Splits an endpoint URL into a connected client and its base path.
fn endpoint_client(
    endpoint: &str,
    ca_bundle: Option<&std::path::Path>,
    timeout: Duration,
) -> Result<(HttpClient, String), HelperError> {
    let parsed = url::Url::parse(endpoint)
        .map_err(|err| HelperError::invalid_argument(format!("invalid URL `{endpoint}`: {err}")))?;
    let scheme = Scheme::parse(parsed.scheme())?;
    let host = parsed
        .host_str()
        .ok_or_else(|| HelperError::invalid_argument(format!("URL `{endpoint}` has no host")))?
        .to_string();
    let client = HttpClient::new(scheme, host, parsed.port(), ca_bundle, timeout)?;
    let path = parsed.path().trim_end_matches('/').to_string();
    Ok((client, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystone_catalog_parses_token_and_endpoint() {
        let body = r#"{
            "access": {
                "token": {"id": "tok-123", "expires": "2026-01-01T00:00:00Z"},
                "serviceCatalog": [
                    {"type": "identity", "endpoints": []},
                    {"type": "object-store", "endpoints": [
                        {"publicURL": "http://swift.local:8080/v1/AUTH_demo"}
                    ]}
                ]
            }
        }"#;
        let parsed: KeystoneAccessEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.access.token.id, "tok-123");
        let endpoint = parsed
            .access
            .service_catalog
            .iter()
            .find(|service| service.service_type == "object-store")
            .unwrap();
        assert_eq!(
            endpoint.endpoints[0].public_url,
            "http://swift.local:8080/v1/AUTH_demo"
        );
    }

    #[test]
    fn listing_entries_parse_names_and_sizes() {
        let body = r#"[{"name": "a/b", "bytes": 10, "hash": "x"}, {"name": "a/c"}]"#;
        let entries: Vec<SwiftListEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries[0].name, "a/b");
        assert_eq!(entries[0].bytes, 10);
        assert_eq!(entries[1].bytes, 0);
    }

    #[test]
    fn status_codes_map_into_the_taxonomy() {
        let failure = |status: u16| {
            check_swift_outcome(
                "GetObject",
                HttpResponse {
                    status,
                    headers: Vec::new(),
                    body: Vec::new(),
                },
            )
            .unwrap_err()
        };
        assert_eq!(failure(404).error.kind(), ErrorKind::NotFound);
        assert!(!failure(404).is_transient());
        assert_eq!(failure(403).error.kind(), ErrorKind::PermissionDenied);
        assert_eq!(failure(503).error.kind(), ErrorKind::HostUnreachable);
        assert!(failure(503).is_transient());
        assert_eq!(failure(507).error.kind(), ErrorKind::NoSpace);
        assert!(failure(502).is_transient());
    }

    #[test]
    fn endpoint_urls_split_into_host_and_path() {
        let (client, path) = endpoint_client(
            "http://keystone.local:5000/v2.0/",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.host(), "keystone.local");
        assert_eq!(client.host_header(), "keystone.local:5000");
        assert_eq!(path, "/v2.0");
    }
}
