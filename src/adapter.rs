//! Object-Storage Adapter Module
//!
//! Adapters classify incoming requests ("is this a cacheable object fetch?"),
//! derive the cache fingerprint, and synthesize local responses from cached
//! records. Dispatch is variant-based; registration order defines match
//! priority.

use crate::config::{AdapterKind, AdapterSpec};
use crate::engine::RequestHead;
use crate::object_cache::StoredRecord;
use crate::{ProxyError, Result};

/// Identity of one stored object as derived from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub host: String,
    pub bucket: String,
    pub key: String,
}

/// Outcome of running the adapter chain over a parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterDecision {
    Intercept {
        adapter_index: usize,
        fingerprint: String,
    },
    PassThrough,
}

/// A registered object-storage adapter
#[derive(Debug, Clone)]
pub enum ObjectStoreAdapter {
    Generic(GenericAdapter),
    Minio(MinioAdapter),
}

/// Path-style adapter synthesizing plain octet-stream responses
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    /// Substring the Host header must contain; empty matches any host
    pub host: String,
}

/// MinIO-dialect adapter; synthesis restores the captured origin headers
#[derive(Debug, Clone)]
pub struct MinioAdapter {
    pub host: String,
}

/// Bucket-location probes are served by the origin, never from cache
const LOCATION_QUERY: &str = "location";

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".."
}

/// Split `/<bucket>/<key...>` into its bucket and key.
///
/// Every path segment must be non-empty and must not be `.` or `..`; keys may
/// span multiple segments.
fn parse_object_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() < 2 {
        return None;
    }
    if !segments.iter().all(|s| valid_segment(s)) {
        return None;
    }
    let bucket = segments[0].to_string();
    let key = segments[1..].join("/");
    Some((bucket, key))
}

fn request_matches(head: &RequestHead, adapter_host: &str) -> bool {
    if head.method != "GET" {
        return false;
    }
    if head.query.as_deref() == Some(LOCATION_QUERY) {
        return false;
    }
    if !head.host.contains(adapter_host) {
        return false;
    }
    parse_object_path(&head.path).is_some()
}

fn extract_object(head: &RequestHead) -> Result<ObjectKey> {
    if head.method != "GET" {
        return Err(ProxyError::InvalidKey(format!(
            "only GET requests are cacheable, got {}",
            head.method
        )));
    }
    if head.host.is_empty() {
        return Err(ProxyError::InvalidKey("request has no host".to_string()));
    }
    let (bucket, key) = parse_object_path(&head.path)
        .ok_or_else(|| ProxyError::InvalidKey(format!("not an object path: {}", head.path)))?;
    Ok(ObjectKey {
        host: head.host.clone(),
        bucket,
        key,
    })
}

fn status_line_and_length(body_len: usize) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", body_len)
}

impl ObjectStoreAdapter {
    pub fn from_spec(spec: &AdapterSpec) -> Self {
        match spec.kind {
            AdapterKind::Generic => ObjectStoreAdapter::Generic(GenericAdapter {
                host: spec.host.clone(),
            }),
            AdapterKind::Minio => ObjectStoreAdapter::Minio(MinioAdapter {
                host: spec.host.clone(),
            }),
        }
    }

    /// Short tag prefixed onto fingerprints so adapters can never alias each
    /// other's cache entries
    pub fn tag(&self) -> &'static str {
        match self {
            ObjectStoreAdapter::Generic(_) => "generic",
            ObjectStoreAdapter::Minio(_) => "minio",
        }
    }

    pub fn should_intercept(&self, head: &RequestHead) -> bool {
        match self {
            ObjectStoreAdapter::Generic(a) => request_matches(head, &a.host),
            ObjectStoreAdapter::Minio(a) => request_matches(head, &a.host),
        }
    }

    pub fn extract_object(&self, head: &RequestHead) -> Result<ObjectKey> {
        extract_object(head)
    }

    /// Derive the cache fingerprint for a request this adapter intercepts
    pub fn fingerprint(&self, head: &RequestHead) -> Result<String> {
        let object = self.extract_object(head)?;
        Ok(format!(
            "{}:{}/{}/{}",
            self.tag(),
            object.host,
            object.bucket,
            object.key
        ))
    }

    /// Build the full wire bytes of a local `200 OK` response for a cached
    /// record
    pub fn synthesize_response(&self, record: &StoredRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(record.body.len() + 256);
        out.extend_from_slice(status_line_and_length(record.body.len()).as_bytes());
        match self {
            ObjectStoreAdapter::Generic(_) => {
                out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            }
            ObjectStoreAdapter::Minio(_) => {
                // Captured origin headers go back verbatim
                for (name, value) in &record.headers {
                    out.extend_from_slice(name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(value.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&record.body);
        out
    }
}

/// Run the adapter chain in registration order; first match wins.
///
/// A matching adapter that then fails fingerprint extraction sends the
/// request to the forward path rather than trying later adapters.
pub fn classify(adapters: &[ObjectStoreAdapter], head: &RequestHead) -> AdapterDecision {
    for (index, adapter) in adapters.iter().enumerate() {
        if adapter.should_intercept(head) {
            return match adapter.fingerprint(head) {
                Ok(fingerprint) => AdapterDecision::Intercept {
                    adapter_index: index,
                    fingerprint,
                },
                Err(_) => AdapterDecision::PassThrough,
            };
        }
    }
    AdapterDecision::PassThrough
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn clean_segment(s: &str) -> String {
        let cleaned: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if cleaned.is_empty() {
            "x".to_string()
        } else {
            cleaned
        }
    }

    /// Fingerprints are deterministic and reconstruct the object identity
    #[quickcheck]
    fn prop_fingerprint_deterministic(host: String, bucket: String, key: String) -> TestResult {
        let host = clean_segment(&host);
        let bucket = clean_segment(&bucket);
        let key = clean_segment(&key);

        let head = RequestHead {
            method: "GET".to_string(),
            path: format!("/{}/{}", bucket, key),
            query: None,
            host: host.clone(),
            headers: Vec::new(),
        };

        let adapter = ObjectStoreAdapter::Generic(GenericAdapter {
            host: String::new(),
        });
        let first = adapter.fingerprint(&head).unwrap();
        let second = adapter.fingerprint(&head).unwrap();
        if first != second {
            return TestResult::failed();
        }
        if first != format!("generic:{}/{}/{}", host, bucket, key) {
            return TestResult::failed();
        }
        TestResult::passed()
    }

    /// The adapter tag keeps fingerprints distinct across adapter kinds
    #[quickcheck]
    fn prop_fingerprints_distinct_across_adapters(bucket: String, key: String) -> TestResult {
        let bucket = clean_segment(&bucket);
        let key = clean_segment(&key);
        let head = RequestHead {
            method: "GET".to_string(),
            path: format!("/{}/{}", bucket, key),
            query: None,
            host: "h".to_string(),
            headers: Vec::new(),
        };

        let generic = ObjectStoreAdapter::Generic(GenericAdapter {
            host: String::new(),
        });
        let minio = ObjectStoreAdapter::Minio(MinioAdapter {
            host: String::new(),
        });
        if generic.fingerprint(&head).unwrap() == minio.fingerprint(&head).unwrap() {
            return TestResult::failed();
        }
        TestResult::passed()
    }

    /// Synthesis always carries a Content-Length equal to the body
    #[quickcheck]
    fn prop_synthesis_content_length(body: Vec<u8>) -> TestResult {
        if body.is_empty() {
            return TestResult::discard();
        }
        let adapter = ObjectStoreAdapter::Generic(GenericAdapter {
            host: String::new(),
        });
        let record = StoredRecord {
            headers: Vec::new(),
            body: body.clone(),
        };
        let response = adapter.synthesize_response(&record);
        let expected_header = format!("Content-Length: {}\r\n", body.len());
        let text = String::from_utf8_lossy(&response);
        if !text.contains(&expected_header) {
            return TestResult::failed();
        }
        if !response.ends_with(&body) {
            return TestResult::failed();
        }
        TestResult::passed()
    }
}
