//! S3-compatible object store over the REST API with AWS Signature V4.
//!
//! Works against AWS and against S3-compatible services (DigitalOcean Spaces,
//! MinIO) through a custom endpoint, which switches to path-style addressing.
//! Signing uses `hmac` + `sha2` directly.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::object_store::{ObjectMeta, ObjectStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// Credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
/// optional `AWS_SESSION_TOKEN`.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, StoreError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| StoreError::Config("AWS_ACCESS_KEY_ID is not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| StoreError::Config("AWS_SECRET_ACCESS_KEY is not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// e.g. `https://fra1.digitaloceanspaces.com`; `None` targets AWS.
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: reqwest::Client,
    config: S3Config,
    creds: AwsCredentials,
}

struct Target {
    host: String,
    canonical_uri: String,
    url: String,
}

impl S3ObjectStore {
    pub fn new(config: S3Config, creds: AwsCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            creds,
        }
    }

    pub fn from_env(config: S3Config) -> Result<Self, StoreError> {
        Ok(Self::new(config, AwsCredentials::from_env()?))
    }

    fn target(&self, key: &str) -> Target {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.config.endpoint_url {
            Some(endpoint) => {
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
                let canonical_uri = if key.is_empty() {
                    format!("/{}", self.config.bucket)
                } else {
                    format!("/{}/{}", self.config.bucket, encoded_key)
                };
                let url = format!("{scheme}://{host}{canonical_uri}");
                Target {
                    host,
                    canonical_uri,
                    url,
                }
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                );
                let canonical_uri = format!("/{encoded_key}");
                let url = format!("https://{host}{canonical_uri}");
                Target {
                    host,
                    canonical_uri,
                    url,
                }
            }
        }
    }

    /// Build a SigV4-signed request. `extra_headers` must be lowercase
    /// `x-amz-*` names; they are signed and sent.
    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        payload: &[u8],
        extra_headers: &[(&str, String)],
    ) -> reqwest::RequestBuilder {
        let target = self.target(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut sorted_params = query.to_vec();
        sorted_params.sort();
        let canonical_querystring = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (name, value) in extra_headers {
            headers.push((name.to_string(), value.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
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
            target.canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_querystring.is_empty() {
            target.url
        } else {
            format!("{}?{}", target.url, canonical_querystring)
        };

        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", authorization);
        for (name, value) in headers.into_iter().filter(|(k, _)| k != "host") {
            request = request.header(name, value);
        }
        request
    }

    async fn send(
        &self,
        key: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        request.send().await.map_err(|source| StoreError::Transport {
            key: key.to_string(),
            source,
        })
    }

    async fn status_error(key: &str, resp: reqwest::Response) -> StoreError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        StoreError::Status {
            status,
            key: key.to_string(),
            body: body.chars().take(500).collect(),
        }
    }

    fn etag_of(resp: &reqwest::Response) -> String {
        resp.headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self) -> String {
        format!("s3://{}", self.config.bucket)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let request = self.signed(Method::GET, key, &[], b"", &[]);
        let resp = self.send(key, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(key, resp).await);
        }
        let bytes = resp.bytes().await.map_err(|source| StoreError::Transport {
            key: key.to_string(),
            source,
        })?;
        debug!(key, bytes = bytes.len(), "s3 get");
        Ok(Some(bytes.to_vec()))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let request = self.signed(Method::HEAD, key, &[], b"", &[]);
        let resp = self.send(key, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(key, resp).await);
        }
        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_modified = resp
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            etag: Self::etag_of(&resp),
            size,
            last_modified,
        }))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<ObjectMeta, StoreError> {
        let size = body.len() as u64;
        let request = self.signed(Method::PUT, key, &[], &body, &[]).body(body);
        let resp = self.send(key, request).await?;
        if !resp.status().is_success() {
            return Err(Self::status_error(key, resp).await);
        }
        debug!(key, size, "s3 put");
        Ok(ObjectMeta {
            key: key.to_string(),
            etag: Self::etag_of(&resp),
            size,
            last_modified: Some(Utc::now()),
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let source = format!(
            "/{}/{}",
            self.config.bucket,
            from.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
        );
        let request = self.signed(Method::PUT, to, &[], b"", &[("x-amz-copy-source", source)]);
        let resp = self.send(to, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                key: from.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(to, resp).await);
        }
        // CopyObject can report failure inside a 200 body.
        let body = resp.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            return Err(StoreError::Status {
                status: 200,
                key: to.to_string(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let request = self.signed(Method::DELETE, key, &[], b"", &[]);
        let resp = self.send(key, request).await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::status_error(key, resp).await)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(token) = &continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let request = self.signed(Method::GET, "", &query, b"", &[]);
            let resp = self.send(prefix, request).await?;
            if !resp.status().is_success() {
                return Err(Self::status_error(prefix, resp).await);
            }
            let xml = resp.text().await.map_err(|source| StoreError::Transport {
                key: prefix.to_string(),
                source,
            })?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

fn parse_list_objects_response(xml: &str) -> (Vec<ObjectMeta>, bool, Option<String>) {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        objects.push(ObjectMeta {
            key: xml_unescape(&key),
            etag: xml_unescape(&extract_xml_value(block, "ETag").unwrap_or_default())
                .trim_matches('"')
                .to_string(),
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: extract_xml_value(block, "LastModified")
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        });
    }

    (objects, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: Option<&str>) -> S3ObjectStore {
        S3ObjectStore::new(
            S3Config {
                bucket: "offers".into(),
                region: "fra1".into(),
                endpoint_url: endpoint.map(str::to_string),
            },
            AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
        )
    }

    #[test]
    fn custom_endpoint_uses_path_style() {
        let t = store(Some("https://fra1.digitaloceanspaces.com/")).target("jobs/sql/jobs.sqlite");
        assert_eq!(t.host, "fra1.digitaloceanspaces.com");
        assert_eq!(t.canonical_uri, "/offers/jobs/sql/jobs.sqlite");
        assert_eq!(
            t.url,
            "https://fra1.digitaloceanspaces.com/offers/jobs/sql/jobs.sqlite"
        );
    }

    #[test]
    fn aws_uses_virtual_host_and_encodes_keys() {
        let t = store(None).target("jobs/year=2025/a b.jsonl");
        assert_eq!(t.host, "offers.s3.fra1.amazonaws.com");
        assert_eq!(t.canonical_uri, "/jobs/year%3D2025/a%20b.jsonl");
    }

    #[test]
    fn list_response_parses_pages_and_strips_etag_quotes() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>tok-2</NextContinuationToken>
            <Contents><Key>jobs/year=2025/month=03/day=05/justjoinit_2025-03-05.jsonl</Key>
              <LastModified>2025-03-06T01:02:03.000Z</LastModified>
              <ETag>&quot;abc123&quot;</ETag><Size>42</Size></Contents>
            <Contents><Key>jobs/dir/</Key><ETag>"d"</ETag><Size>0</Size></Contents>
        </ListBucketResult>"#;

        let (objects, truncated, token) = parse_list_objects_response(xml);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok-2"));
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].etag, "abc123");
        assert_eq!(objects[0].size, 42);
        assert!(objects[0].last_modified.is_some());
    }

    #[test]
    fn signing_key_matches_aws_reference_vector() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }
}
