//! Amazon S3 object store backend.
//!
//! Implements the [`ObjectStore`] trait against the S3 REST API with
//! AWS Signature V4 authentication. Supports custom endpoints for
//! S3-compatible services (MinIO, LocalStack).
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing — no
//! C library dependencies like `aws-lc-sys`, making it compatible with
//! all build environments including Nix.
//!
//! # Environment Variables
//!
//! Credentials are read from environment variables:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (for temporary credentials / IAM roles)
//!
//! # Operations
//!
//! - `PutObject` with `x-amz-meta-*` headers carrying provenance
//! - `GetObject` / `HeadObject`
//! - `ListObjectsV2` with continuation-token pagination
//! - `DeleteObjects` (bulk, up to 1000 keys per request)

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;
use crate::object_store::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-backed [`ObjectStore`].
pub struct S3ObjectStore {
    client: reqwest::Client,
    creds: AwsCredentials,
    bucket: String,
    region: String,
    /// Host used for requests, e.g. `<bucket>.s3.<region>.amazonaws.com`.
    host: String,
    /// `"https"` unless a custom endpoint specifies `http://`.
    scheme: String,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;

        let (scheme, host) = match config.endpoint_url {
            Some(ref endpoint) => {
                // Custom endpoint (MinIO, LocalStack, etc.)
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host)
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
            ),
        };

        Ok(Self {
            client: reqwest::Client::new(),
            creds,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            host,
            scheme,
        })
    }

    /// Send a SigV4-signed request and return the response.
    ///
    /// `key` is the raw object key (empty for bucket-level operations),
    /// `query` the unencoded query parameters, `extra_headers` any
    /// additional headers to sign (names must already be lowercase).
    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("/{}", encoded_key);

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.extend(extra_headers.iter().cloned());
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url = format!("{}?{}", url, canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization);

        // Everything that was signed (minus host, which reqwest sets) goes
        // on the wire with the same value.
        for (name, value) in &headers {
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }

        Ok(req.body(body).send().await?)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut extra_headers = vec![("content-type".to_string(), content_type.to_string())];
        for (name, value) in metadata {
            extra_headers.push((format!("x-amz-meta-{}", name.to_lowercase()), value.clone()));
        }

        let resp = self
            .signed_request(
                reqwest::Method::PUT,
                key,
                &[],
                &extra_headers,
                bytes.to_vec(),
            )
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .signed_request(reqwest::Method::GET, key, &[], &[], Vec::new())
            .await?;

        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_request(reqwest::Method::GET, "", &query, &[], Vec::new())
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}) for bucket '{}': {}",
                    status,
                    self.bucket,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_keys(&xml);
            keys.extend(batch);

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        let resp = self
            .signed_request(reqwest::Method::HEAD, key, &[], &[], Vec::new())
            .await?;

        if !resp.status().is_success() {
            bail!(
                "S3 HeadObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        let mut metadata = HashMap::new();
        for (name, value) in resp.headers() {
            if let Some(meta_key) = name.as_str().strip_prefix("x-amz-meta-") {
                if let Ok(v) = value.to_str() {
                    metadata.insert(meta_key.to_string(), v.to_string());
                }
            }
        }
        Ok(metadata)
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let body = build_delete_request_xml(keys);
        let body_bytes = body.into_bytes();

        // DeleteObjects requires an integrity checksum of the XML body.
        let mut hasher = Sha256::new();
        hasher.update(&body_bytes);
        let checksum = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

        let extra_headers = vec![
            ("content-type".to_string(), "application/xml".to_string()),
            ("x-amz-checksum-sha256".to_string(), checksum),
        ];
        let query = vec![("delete".to_string(), String::new())];

        let resp = self
            .signed_request(
                reqwest::Method::POST,
                "",
                &query,
                &extra_headers,
                body_bytes,
            )
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 DeleteObjects failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        let xml = resp.text().await?;
        Ok(count_deleted(&xml))
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` XML response into object keys plus pagination
/// state (truncated flag, next continuation token).
fn parse_list_keys(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        if let Some(end) = remaining[block_start..].find("</Contents>") {
            let block = &remaining[block_start..block_start + end];
            if let Some(key) = extract_xml_value(block, "Key") {
                if !key.is_empty() && !key.ends_with('/') {
                    keys.push(key);
                }
            }
            remaining = &remaining[block_start + end + "</Contents>".len()..];
        } else {
            break;
        }
    }

    (keys, is_truncated, next_token)
}

/// Build the `DeleteObjects` request body.
fn build_delete_request_xml(keys: &[String]) -> String {
    let mut xml = String::from(r#"<Delete xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#);
    for key in keys {
        xml.push_str("<Object><Key>");
        xml.push_str(&xml_escape(key));
        xml.push_str("</Key></Object>");
    }
    xml.push_str("</Delete>");
    xml
}

/// Count `<Deleted>` blocks in a `DeleteObjects` response.
fn count_deleted(xml: &str) -> usize {
    xml.matches("<Deleted>").count()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let value_start = start + open.len();
        if let Some(end) = xml[value_start..].find(&close) {
            return Some(xml[value_start..value_start + end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_passes_unreserved() {
        assert_eq!(uri_encode("abc-123_.~"), "abc-123_.~");
    }

    #[test]
    fn test_uri_encode_escapes_special() {
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20260823", "us-east-1", "s3");
        let b = derive_signing_key("secret", "20260823", "us-east-1", "s3");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_parse_list_keys_with_pagination() {
        let xml = r#"<?xml version="1.0"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token123</NextContinuationToken>
  <Contents><Key>a1b2.pdf</Key><Size>10</Size></Contents>
  <Contents><Key>folder/</Key><Size>0</Size></Contents>
  <Contents><Key>c3d4.csv</Key><Size>20</Size></Contents>
</ListBucketResult>"#;

        let (keys, truncated, token) = parse_list_keys(xml);
        assert_eq!(keys, vec!["a1b2.pdf", "c3d4.csv"]);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("token123"));
    }

    #[test]
    fn test_delete_request_xml() {
        let xml = build_delete_request_xml(&["a.pdf".to_string(), "b&c.csv".to_string()]);
        assert!(xml.starts_with("<Delete"));
        assert!(xml.contains("<Object><Key>a.pdf</Key></Object>"));
        assert!(xml.contains("<Key>b&amp;c.csv</Key>"));
    }

    #[test]
    fn test_count_deleted() {
        let xml = "<DeleteResult><Deleted><Key>a</Key></Deleted><Deleted><Key>b</Key></Deleted></DeleteResult>";
        assert_eq!(count_deleted(xml), 2);
    }
}
