//! S3-semantics object store client.
//!
//! Path-style REST calls against a configured endpoint, signed with AWS
//! Signature Version 4. Error codes are translated into the common
//! taxonomy at this boundary; the transient subset is reissued through
//! the shared retry combinator before any error escapes.

use crate::error::{ErrorKind, HelperError};
use crate::helper::{params, Params, DEFAULT_OP_TIMEOUT};
use crate::objectstore::http::{uri_encode, HttpClient, HttpRequest, HttpResponse, Scheme};
use crate::objectstore::{ObjectBackend, ObjectEntry, MAX_DELETE_BATCH};
use crate::retry::{retry, RetryPolicy};
use crate::telemetry::SharedMetricsRegistry;
use hmac::{Hmac, Mac};
use log::warn;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Region tags recognized when inferring the region from the hostname.
const KNOWN_REGIONS: &[&str] = &[
    "us-east-2",
    "us-east-1",
    "us-west-1",
    "us-west-2",
    "ca-central-1",
    "ap-south-1",
    "ap-northeast-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
    "eu-central-1",
    "eu-west-1",
    "eu-west-2",
    "sa-east-1",
];

const DEFAULT_REGION: &str = "us-east-1";

/// Error codes worth reissuing, per the S3 error convention.
const TRANSIENT_CODES: &[&str] = &[
    "InternalFailure",
    "InvalidQueryParameter",
    "InvalidParameterCombination",
    "InvalidParameterValue",
    "RequestExpired",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
    "NetworkConnection",
];

/// Infers the region by substring match against the known tags.
pub fn region_for_hostname(hostname: &str) -> &'static str {
    KNOWN_REGIONS
        .iter()
        .find(|region| hostname.contains(*region))
        .copied()
        .unwrap_or(DEFAULT_REGION)
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub hostname: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub scheme: Scheme,
    pub ca_bundle: Option<PathBuf>,
    pub timeout: Duration,
}

impl S3Config {
    /// Factory parameters: `hostname`, `bucketName`, `accessKey`,
    /// `secretKey` (required), `scheme` ∈ {http, https} (default https),
    /// `signatureVersion` (only "4"), `caBundlePath`, `timeout` (ms).
    pub fn from_params(params_map: &Params) -> Result<Self, HelperError> {
        let signature_version =
            params::optional(params_map, "signatureVersion").unwrap_or_else(|| "4".to_string());
        if signature_version != "4" {
            return Err(HelperError::invalid_argument(format!(
                "unsupported signatureVersion `{signature_version}` (only 4)"
            )));
        }
        let scheme = match params::optional(params_map, "scheme") {
            Some(raw) => Scheme::parse(&raw)?,
            None => Scheme::Https,
        };
        Ok(Self {
            hostname: params::required(params_map, "hostname")?,
            bucket: params::required(params_map, "bucketName")?,
            access_key: params::required(params_map, "accessKey")?,
            secret_key: params::required(params_map, "secretKey")?,
            scheme,
            ca_bundle: params::optional(params_map, "caBundlePath").map(PathBuf::from),
            timeout: params::timeout(params_map, DEFAULT_OP_TIMEOUT)?,
        })
    }
}

/// S3 failure before translation: the wire code plus the mapped error.
struct S3Failure {
    code: Option<String>,
    error: HelperError,
}

impl S3Failure {
    fn transport(error: HelperError) -> Self {
        Self { code: None, error }
    }

    fn is_transient(&self) -> bool {
        if let Some(code) = &self.code {
            return TRANSIENT_CODES.contains(&code.as_str());
        }
        // Transport-level failures count as NetworkConnection.
        matches!(
            self.error.kind(),
            ErrorKind::TimedOut | ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable
        )
    }
}

pub struct S3Client {
    http: HttpClient,
    bucket: String,
    access_key: String,
    secret_key: String,
    region: &'static str,
    retry_policy: RetryPolicy,
    metrics: Option<SharedMetricsRegistry>,
}

impl S3Client {
    pub fn new(config: S3Config) -> Result<Self, HelperError> {
        let (host, port) = split_host_port(&config.hostname)?;
        let region = region_for_hostname(&config.hostname);
        let http = HttpClient::new(
            config.scheme,
            host,
            port,
            config.ca_bundle.as_deref(),
            config.timeout,
        )?;
        Ok(Self {
            http,
            bucket: config.bucket,
            access_key: config.access_key,
            secret_key: config.secret_key,
            region,
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

    pub fn region(&self) -> &'static str {
        self.region
    }

    /// Issues one S3 operation through the shared retry loop.
    fn execute(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(String, String)],
        method: &'static str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> Result<HttpResponse, HelperError> {
        let result = retry(
            &self.retry_policy,
            S3Failure::is_transient,
            |failure: &S3Failure| {
                warn!(
                    "retrying S3 operation {operation} after error: {}",
                    failure.error
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_counter(&format!("s3.{operation}.retries"), 1);
                }
            },
            || {
                let request = self.signed_request(path, query, method, body.clone(), extra_headers);
                let response = self
                    .http
                    .execute(&request)
                    .map_err(S3Failure::transport)?;
                check_s3_outcome(operation, response)
            },
        );
        result.map_err(|failure| failure.error)
    }

    fn signed_request(
        &self,
        path: &str,
        query: &[(String, String)],
        method: &'static str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> HttpRequest {
        let canonical_uri = uri_encode(path, true);
        let canonical_query = canonical_query_string(query);
        let payload_hash = hex(&Sha256::digest(&body));
        let (amz_date, date_stamp) = amz_timestamp(SystemTime::now());
        let host = self.http.host_header().to_string();

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\nhost;x-amz-content-sha256;x-amz-date\n{payload_hash}"
        );
        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );
        let date_key = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let region_key = hmac_sha256(&date_key, self.region.as_bytes());
        let service_key = hmac_sha256(&region_key, b"s3");
        let signing_key = hmac_sha256(&service_key, b"aws4_request");
        let signature = hex(&hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={signature}",
            self.access_key
        );

        let target = if canonical_query.is_empty() {
            canonical_uri
        } else {
            format!("{canonical_uri}?{canonical_query}")
        };
        let mut request = HttpRequest::new(method, target)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization);
        for (name, value) in extra_headers {
            request = request.header(name.clone(), value.clone());
        }
        request.body(body)
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key)
    }

    fn count_error(&self, counter: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(counter, 1);
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<(Vec<ObjectEntry>, Option<String>), HelperError> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
            ("max-keys".to_string(), "1000".to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        }
        let response = self.execute(
            "ListObjectsV2",
            &format!("/{}", self.bucket),
            &query,
            "GET",
            Vec::new(),
            &[],
        )?;
        let text = String::from_utf8_lossy(&response.body).into_owned();
        let mut entries = Vec::new();
        for contents in xml_blocks(&text, "Contents") {
            let key = match extract_xml_tag(contents, "Key") {
                Some(key) => xml_unescape(&key),
                None => continue,
            };
            let size = extract_xml_tag(contents, "Size")
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            entries.push(ObjectEntry { key, size });
        }
        let truncated = extract_xml_tag(&text, "IsTruncated").as_deref() == Some("true");
        let next = if truncated {
            extract_xml_tag(&text, "NextContinuationToken").map(|token| xml_unescape(&token))
        } else {
            None
        };
        Ok((entries, next))
    }
}

impl ObjectBackend for S3Client {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn get_object(&self, key: &str, offset: u64, size: usize) -> Result<Vec<u8>, HelperError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let timer = self.metrics.as_ref().map(|metrics| metrics.timer("s3.read"));
        let range = format!("bytes={offset}-{}", offset + size as u64 - 1);
        let result = self.execute(
            "GetObject",
            &self.object_path(key),
            &[],
            "GET",
            Vec::new(),
            &[("Range".to_string(), range)],
        );
        match result {
            Ok(response) => {
                let body = response.body;
                if let Some(timer) = timer {
                    timer.stop(body.len() as u64);
                }
                Ok(body)
            }
            // Reading at or past the end of the object is a legal short
            // read of zero bytes, not an error.
            Err(err) if err.errno() == Some(416) => Ok(Vec::new()),
            Err(err) => {
                self.count_error("s3.errors.read");
                Err(err)
            }
        }
    }

    fn put_object(&self, key: &str, data: &[u8]) -> Result<usize, HelperError> {
        let timer = self.metrics.as_ref().map(|metrics| metrics.timer("s3.write"));
        let result = self.execute(
            "PutObject",
            &self.object_path(key),
            &[],
            "PUT",
            data.to_vec(),
            &[],
        );
        match result {
            Ok(_) => {
                if let Some(timer) = timer {
                    timer.stop(data.len() as u64);
                }
                Ok(data.len())
            }
            Err(err) => {
                self.count_error("s3.errors.write");
                Err(err)
            }
        }
    }

    fn delete_objects(&self, keys: &[String]) -> Result<(), HelperError> {
        debug_assert!(keys.len() <= MAX_DELETE_BATCH);
        let mut body = String::from("<Delete><Quiet>true</Quiet>");
        for key in keys {
            body.push_str("<Object><Key>");
            body.push_str(&xml_escape(key));
            body.push_str("</Key></Object>");
        }
        body.push_str("</Delete>");
        let body = body.into_bytes();
        let content_md5 = base64(&Md5::digest(&body));
        self.execute(
            "DeleteObjects",
            &format!("/{}", self.bucket),
            &[("delete".to_string(), String::new())],
            "POST",
            body,
            &[
                ("Content-MD5".to_string(), content_md5),
                ("Content-Type".to_string(), "application/xml".to_string()),
            ],
        )?;
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, HelperError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let (page, next) = self.list_page(prefix, continuation.as_deref())?;
            entries.extend(page);
            match next {
                Some(token) => continuation = Some(token),
                None => return Ok(entries),
            }
        }
    }

    fn head_object(&self, key: &str) -> Result<ObjectEntry, HelperError> {
        let response = self.execute(
            "HeadObject",
            &self.object_path(key),
            &[],
            "HEAD",
            Vec::new(),
            &[],
        )?;
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

/// Success passes the response through; failure yields the wire code
/// (when the body carries one) and the mapped taxonomy error.
fn check_s3_outcome(
    operation: &str,
    response: HttpResponse,
) -> Result<HttpResponse, S3Failure> {
    if response.status < 300 {
        return Ok(response);
    }
    let text = String::from_utf8_lossy(&response.body).into_owned();
    let code = extract_xml_tag(&text, "Code");
    let kind = match code.as_deref() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("ResourceNotFound") => ErrorKind::NotFound,
        Some("AccessDenied") => ErrorKind::PermissionDenied,
        Some("ServiceUnavailable") => ErrorKind::HostUnreachable,
        Some("NetworkConnection") => ErrorKind::NetworkUnreachable,
        Some("RequestExpired") => ErrorKind::TimedOut,
        Some(other) if other.starts_with("InvalidParameter") || other == "InvalidQueryParameter" => {
            ErrorKind::InvalidArgument
        }
        _ => match response.status {
            404 => ErrorKind::NotFound,
            401 | 403 => ErrorKind::PermissionDenied,
            503 => ErrorKind::HostUnreachable,
            _ => ErrorKind::IoError,
        },
    };
    let context = match &code {
        Some(code) => format!("{operation}: {code} (HTTP {})", response.status),
        None => format!("{operation}: HTTP {}", response.status),
    };
    Err(S3Failure {
        code,
        error: HelperError::with_errno(kind, response.status as i32, context),
    })
}

fn split_host_port(hostname: &str) -> Result<(String, Option<u16>), HelperError> {
    match hostname.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            let port = port.parse::<u16>().map_err(|_| {
                HelperError::invalid_argument(format!("invalid port in hostname `{hostname}`"))
            })?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((hostname.to_string(), None)),
    }
}

fn canonical_query_string(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(name, value)| (uri_encode(name, false), uri_encode(value, false)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

const BASE64_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for block in data.chunks(3) {
        let b0 = block[0] as u32;
        let b1 = block.get(1).copied().unwrap_or(0) as u32;
        let b2 = block.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if block.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if block.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

/// Timestamp pair (`YYYYMMDD'T'HHMMSS'Z'`, `YYYYMMDD`) for signing.
fn amz_timestamp(now: SystemTime) -> (String, String) {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    let rem = secs % 86400;
    let date = format!("{year:04}{month:02}{day:02}");
    let stamp = format!(
        "{date}T{:02}{:02}{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    );
    (stamp, date)
}

// Days-to-civil conversion over the proleptic Gregorian calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

fn xml_blocks<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                blocks.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    blocks
}

fn extract_xml_tag(text: &str, tag: &str) -> Option<String> {
    xml_blocks(text, tag).first().map(|block| block.to_string())
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_inferred_from_hostname_substrings() {
        assert_eq!(
            region_for_hostname("s3.eu-central-1.amazonaws.com"),
            "eu-central-1"
        );
        assert_eq!(
            region_for_hostname("bucket.s3.ap-southeast-2.example.net"),
            "ap-southeast-2"
        );
        assert_eq!(region_for_hostname("storage.example.com"), "us-east-1");
    }

    #[test]
    fn timestamps_follow_the_signing_format() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let (stamp, date) = amz_timestamp(now);
        assert_eq!(stamp, "20010909T014640Z");
        assert_eq!(date, "20010909");
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn canonical_query_is_sorted_and_encoded() {
        let query = vec![
            ("prefix".to_string(), "a b/c".to_string()),
            ("list-type".to_string(), "2".to_string()),
        ];
        assert_eq!(
            canonical_query_string(&query),
            "list-type=2&prefix=a%20b%2Fc"
        );
    }

    #[test]
    fn encoding_helpers_are_correct() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
        assert_eq!(base64(b"Man"), "TWFu");
        assert_eq!(base64(b"Ma"), "TWE=");
        assert_eq!(base64(b"M"), "TQ==");
        assert_eq!(xml_escape("a&b<c"), "a&amp;b&lt;c");
        assert_eq!(xml_unescape("a&amp;b&lt;c"), "a&b<c");
    }

    #[test]
    fn error_codes_map_into_the_taxonomy() {
        let failure = |status: u16, body: &str| {
            check_s3_outcome(
                "GetObject",
                HttpResponse {
                    status,
                    headers: Vec::new(),
                    body: body.as_bytes().to_vec(),
                },
            )
            .unwrap_err()
        };
        let not_found = failure(404, "<Error><Code>NoSuchKey</Code></Error>");
        assert_eq!(not_found.error.kind(), ErrorKind::NotFound);
        assert!(!not_found.is_transient());
        let denied = failure(403, "<Error><Code>AccessDenied</Code></Error>");
        assert_eq!(denied.error.kind(), ErrorKind::PermissionDenied);
        let unavailable = failure(503, "<Error><Code>ServiceUnavailable</Code></Error>");
        assert_eq!(unavailable.error.kind(), ErrorKind::HostUnreachable);
        assert!(unavailable.is_transient());
        let throttled = failure(503, "<Error><Code>SlowDown</Code></Error>");
        assert_eq!(throttled.error.kind(), ErrorKind::IoError);
        assert!(throttled.is_transient());
        let expired = failure(400, "<Error><Code>RequestExpired</Code></Error>");
        assert_eq!(expired.error.kind(), ErrorKind::TimedOut);
        assert!(expired.is_transient());
        let dropped = failure(400, "<Error><Code>NetworkConnection</Code></Error>");
        assert_eq!(dropped.error.kind(), ErrorKind::NetworkUnreachable);
        assert!(dropped.is_transient());
        let invalid = failure(400, "<Error><Code>InvalidParameterValue</Code></Error>");
        assert_eq!(invalid.error.kind(), ErrorKind::InvalidArgument);
        assert!(invalid.is_transient());
        let opaque = failure(500, "");
        assert_eq!(opaque.error.kind(), ErrorKind::IoError);
        assert!(!opaque.is_transient());
    }

    #[test]
    fn listing_xml_is_parsed_into_entries() {
        let body = "<ListBucketResult><IsTruncated>false</IsTruncated>\
                    <Contents><Key>a/b.txt</Key><Size>12</Size></Contents>\
                    <Contents><Key>a/c&amp;d</Key><Size>3</Size></Contents>\
                    </ListBucketResult>";
        let blocks = xml_blocks(body, "Contents");
        assert_eq!(blocks.len(), 2);
        assert_eq!(extract_xml_tag(blocks[0], "Key").unwrap(), "a/b.txt");
        assert_eq!(
            xml_unescape(&extract_xml_tag(blocks[1], "Key").unwrap()),
            "a/c&d"
        );
    }

    #[test]
    fn hostnames_may_carry_ports() {
        assert_eq!(
            split_host_port("minio.local:9000").unwrap(),
            ("minio.local".to_string(), Some(9000))
        );
        assert_eq!(
            split_host_port("s3.amazonaws.com").unwrap(),
            ("s3.amazonaws.com".to_string(), None)
        );
    }
}
