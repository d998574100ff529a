//! S3-compatible object store.
//!
//! Uploads with a single signed `PUT` using the S3 REST API and AWS
//! Signature V4. Signing uses `hmac` + `sha2` directly, so no AWS SDK or C
//! crypto library is pulled in.
//!
//! # Configuration
//!
//! ```toml
//! [upload]
//! enabled = true
//! store = "s3"
//!
//! [upload.s3]
//! bucket = "lapse-frames"
//! region = "eu-west-2"
//! prefix = "site-a/"
//! # endpoint_url = "http://nas.local:9000"   # MinIO, Garage
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)
//!
//! # Addressing
//!
//! Without `endpoint_url` requests go to
//! `https://<bucket>.s3.<region>.amazonaws.com/<key>`. With one, path-style
//! addressing is used (`<endpoint>/<bucket>/<key>`) and the endpoint's
//! scheme is kept, which is what most self-hosted S3 servers expect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

use crate::config::S3StoreConfig;
use crate::error::{Error, Result};
use crate::storage::RemoteStore;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from the environment.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Config("AWS_ACCESS_KEY_ID environment variable not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            Error::Config("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct S3Store {
    config: S3StoreConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    pub fn new(config: S3StoreConfig, creds: AwsCredentials, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            creds,
            client,
        })
    }

    pub fn from_env(config: S3StoreConfig, timeout: Duration) -> Result<Self> {
        Self::new(config, AwsCredentials::from_env()?, timeout)
    }

    fn object_key(&self, remote: &str) -> String {
        let remote = remote.trim_start_matches('/');
        if self.config.prefix.is_empty() {
            remote.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), remote)
        }
    }

    async fn put_object(&self, local: &Path, key: &str) -> Result<()> {
        let body = tokio::fs::read(local)
            .await
            .map_err(|e| Error::Upload(format!("read {}: {}", local.display(), e)))?;
        let target = ObjectUrl::build(&self.config, key);
        let payload_hash = hex_sha256(&body);
        let signed = sign_request(
            "PUT",
            &target,
            &payload_hash,
            &self.creds,
            &self.config.region,
            Utc::now(),
        )?;

        let mut req = self
            .client
            .put(&target.url)
            .header("Authorization", &signed.authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("Content-Type", content_type(key))
            .body(body);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req.send().await.map_err(|e| {
            Error::Upload(format!(
                "PUT s3://{}/{} failed: {}",
                self.config.bucket, key, e
            ))
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Upload(format!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(300).collect::<String>()
            )));
        }
        tracing::debug!(bucket = %self.config.bucket, key, "Uploaded to S3");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    fn name(&self) -> &str {
        "s3"
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let key = self.object_key(remote);
        self.put_object(local, &key).await
    }
}

// ============ Request Signing ============

/// Where one object lives: full URL, host header, and canonical URI.
#[derive(Debug, Clone, PartialEq)]
struct ObjectUrl {
    url: String,
    host: String,
    canonical_uri: String,
}

impl ObjectUrl {
    fn build(cfg: &S3StoreConfig, key: &str) -> Self {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match cfg.endpoint_url {
            Some(ref endpoint) => {
                let (scheme, rest) = match endpoint.split_once("://") {
                    Some((scheme, rest)) => (scheme, rest),
                    None => ("https", endpoint.as_str()),
                };
                let host = rest.trim_end_matches('/').to_string();
                let canonical_uri = format!("/{}/{}", uri_encode(&cfg.bucket), encoded_key);
                Self {
                    url: format!("{}://{}{}", scheme, host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", cfg.bucket, cfg.region);
                let canonical_uri = format!("/{}", encoded_key);
                Self {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }
}

struct SignedRequest {
    authorization: String,
    amz_date: String,
}

fn sign_request(
    method: &str,
    target: &ObjectUrl,
    payload_hash: &str,
    creds: &AwsCredentials,
    region: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), target.host.clone()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, target.canonical_uri, canonical_headers, signed_headers, payload_hash
    );
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
    })
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Upload(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg(endpoint: Option<&str>) -> S3StoreConfig {
        S3StoreConfig {
            bucket: "lapse-frames".into(),
            region: "eu-west-2".into(),
            prefix: "site-a/".into(),
            endpoint_url: endpoint.map(String::from),
        }
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_virtual_host_url() {
        let u = ObjectUrl::build(&cfg(None), "site-a/images/050324/a b.jpg");
        assert_eq!(u.host, "lapse-frames.s3.eu-west-2.amazonaws.com");
        assert_eq!(u.canonical_uri, "/site-a/images/050324/a%20b.jpg");
        assert_eq!(
            u.url,
            "https://lapse-frames.s3.eu-west-2.amazonaws.com/site-a/images/050324/a%20b.jpg"
        );
    }

    #[test]
    fn test_path_style_url_keeps_scheme() {
        let u = ObjectUrl::build(&cfg(Some("http://nas.local:9000/")), "k/x.jpg");
        assert_eq!(u.host, "nas.local:9000");
        assert_eq!(u.url, "http://nas.local:9000/lapse-frames/k/x.jpg");
        assert_eq!(u.canonical_uri, "/lapse-frames/k/x.jpg");
    }

    #[test]
    fn test_object_key_applies_prefix() {
        let store = S3Store::new(
            cfg(None),
            AwsCredentials::new("AKID", "secret", None),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(store.object_key("images/a.jpg"), "site-a/images/a.jpg");
        assert_eq!(store.object_key("/latest.jpg"), "site-a/latest.jpg");
    }

    #[test]
    fn test_authorization_header_shape() {
        let target = ObjectUrl::build(&cfg(None), "k.jpg");
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let creds = AwsCredentials::new("AKID", "secret", Some("tok".into()));
        let signed = sign_request("PUT", &target, &hex_sha256(b"x"), &creds, "eu-west-2", now)
            .unwrap();
        assert_eq!(signed.amz_date, "20240305T120000Z");
        assert!(signed
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKID/20240305/eu-west-2/s3/aws4_request"));
        assert!(signed.authorization.contains(
            "SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"
        ));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = AwsCredentials::new("AKID", "very-secret", None);
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }
}
