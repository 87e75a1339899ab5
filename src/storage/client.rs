//! Minimal S3-compatible client: SigV4-signed list/get/put/head over plain
//! HTTP, which keeps the service portable across AWS, MinIO and the like.

use crate::http::build_media_client;
use crate::storage::config::{
    S3_ACCESS_KEY_ID, S3_BUCKET, S3_ENDPOINT, S3_PUBLIC_BASE_URL, S3_REGION, S3_SECRET_ACCESS_KEY,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket is not configured")]
    NotConfigured,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("rate limited by storage provider")]
    RateLimited { retry_after: Option<u64> },
    #[error("storage unavailable: HTTP {0}")]
    Unavailable(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid listing payload: {0}")]
    Decode(String),
}

impl StorageError {
    /// Transient failures worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Request(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub key: String,
    pub size: u64,
    pub last_modified: String,
}

#[derive(Debug, Clone)]
pub struct StorageClient {
    http: Client,
    endpoint: String,
    region: String,
    bucket: String,
    access_key: String,
    secret_key: String,
    public_base: String,
}

impl StorageClient {
    pub fn from_env() -> Option<Self> {
        if S3_BUCKET.is_empty() || S3_ACCESS_KEY_ID.is_empty() || S3_SECRET_ACCESS_KEY.is_empty() {
            return None;
        }
        Some(Self {
            http: build_media_client(),
            endpoint: S3_ENDPOINT.trim_end_matches('/').to_string(),
            region: S3_REGION.clone(),
            bucket: S3_BUCKET.clone(),
            access_key: S3_ACCESS_KEY_ID.clone(),
            secret_key: S3_SECRET_ACCESS_KEY.clone(),
            public_base: S3_PUBLIC_BASE_URL.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }

    /// Lists keys under `prefix`, paginating until exhausted or `max_keys`.
    pub async fn list_objects(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<ObjectRecord>, StorageError> {
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut params: Vec<(String, String)> = vec![
                ("list-type".into(), "2".into()),
                ("max-keys".into(), "1000".into()),
                ("prefix".into(), prefix.to_string()),
            ];
            if let Some(token) = &continuation {
                params.push(("continuation-token".into(), token.clone()));
            }
            let response = self
                .signed_request(Method::GET, "", &params, Vec::new(), None, false)
                .await?;
            let page = parse_list_response(&response)?;
            records.extend(page.records);
            debug!(
                target = "vitrine.storage",
                prefix = prefix,
                total = records.len(),
                "list_objects_page"
            );
            if records.len() >= max_keys {
                records.truncate(max_keys);
                break;
            }
            match page.next_continuation {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(records)
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .signed_request(Method::GET, key, &[], Vec::new(), None, false)
            .await?;
        Ok(response)
    }

    /// Uploads a published asset with a public-read ACL.
    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.signed_request(Method::PUT, key, &[], body, Some(content_type), true)
            .await?;
        Ok(())
    }

    /// Existence probe; `Ok(false)` on a clean 404.
    pub async fn head_object(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .signed_request(Method::HEAD, key, &[], Vec::new(), None, false)
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn signed_request(
        &self,
        method: Method,
        key: &str,
        params: &[(String, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
        public_read: bool,
    ) -> Result<Vec<u8>, StorageError> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let canonical_uri = format!("/{}/{}", self.bucket, uri_encode(key, false));
        let canonical_query = canonical_query_string(params);
        let payload_hash = hex::encode(Sha256::digest(&body));
        let host = host_of(&self.endpoint);

        // Signed headers, lowercase and sorted.
        let mut headers: Vec<(String, String)> = vec![
            ("host".into(), host.clone()),
            ("x-amz-content-sha256".into(), payload_hash.clone()),
            ("x-amz-date".into(), amz_date.clone()),
        ];
        if public_read {
            headers.push(("x-amz-acl".into(), "public-read".into()));
        }
        headers.sort();
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );
        let signature = hex::encode(self.signing_key(&date_stamp).chain_sign(&string_to_sign));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key,
        );

        let mut url = format!("{}{}", self.endpoint, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash);
        if public_read {
            request = request.header("x-amz-acl", "public-read");
        }
        if let Some(ct) = content_type {
            request = request.header("Content-Type", ct);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if status == StatusCode::TOO_MANY_REQUESTS || retry_after.is_some() {
                return Err(StorageError::RateLimited { retry_after });
            }
        }
        if status.is_server_error() {
            return Err(StorageError::Unavailable(status.as_u16()));
        }
        if !status.is_success() {
            return Err(StorageError::Request(format!("HTTP {status}")));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|err| StorageError::Request(err.to_string()))
    }

    fn signing_key(&self, date_stamp: &str) -> SigningKey {
        let secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        SigningKey(hmac_sha256(&k_service, b"aws4_request"))
    }
}

struct SigningKey(Vec<u8>);

impl SigningKey {
    fn chain_sign(&self, message: &str) -> Vec<u8> {
        hmac_sha256(&self.0, message.as_bytes())
    }
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn host_of(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// AWS-style URI encoding: unreserved characters pass through, `/` only when
/// encoding a path.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<String> = params
        .iter()
        .map(|(name, value)| format!("{}={}", uri_encode(name, true), uri_encode(value, true)))
        .collect();
    encoded.sort();
    encoded.join("&")
}

struct ListPage {
    records: Vec<ObjectRecord>,
    truncated: bool,
    next_continuation: Option<String>,
}

fn parse_list_response(body: &[u8]) -> Result<ListPage, StorageError> {
    let xml = std::str::from_utf8(body).map_err(|err| StorageError::Decode(err.to_string()))?;
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage {
        records: Vec::new(),
        truncated: false,
        next_continuation: None,
    };
    let mut path: Vec<String> = Vec::new();
    let mut key = String::new();
    let mut size = 0u64;
    let mut last_modified = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                if name == "Contents" {
                    key.clear();
                    size = 0;
                    last_modified.clear();
                }
                path.push(name);
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| StorageError::Decode(err.to_string()))?
                    .to_string();
                let in_contents = path.iter().any(|p| p == "Contents");
                match path.last().map(|s| s.as_str()) {
                    Some("Key") if in_contents => key = value,
                    Some("Size") if in_contents => size = value.parse().unwrap_or(0),
                    Some("LastModified") if in_contents => last_modified = value,
                    Some("IsTruncated") => page.truncated = value == "true",
                    Some("NextContinuationToken") => page.next_continuation = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                if end.name().as_ref() == b"Contents" && !key.is_empty() {
                    page.records.push(ObjectRecord {
                        key: std::mem::take(&mut key),
                        size,
                        last_modified: std::mem::take(&mut last_modified),
                    });
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(StorageError::Decode(err.to_string())),
            _ => {}
        }
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>bucket</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-1</NextContinuationToken>
  <Contents>
    <Key>imagens/leite-parmalat-1l-abcdef-v2.webp</Key>
    <LastModified>2026-01-10T12:00:00.000Z</LastModified>
    <Size>48213</Size>
  </Contents>
  <Contents>
    <Key>imagens/web-0011223344556677.png</Key>
    <LastModified>2026-02-01T08:30:00.000Z</LastModified>
    <Size>90111</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn parses_list_objects_page() {
        let page = parse_list_response(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(page.records.len(), 2);
        assert!(page.truncated);
        assert_eq!(page.next_continuation.as_deref(), Some("token-1"));
        assert_eq!(
            page.records[0].key,
            "imagens/leite-parmalat-1l-abcdef-v2.webp"
        );
        assert_eq!(page.records[0].size, 48213);
    }

    #[test]
    fn rejects_invalid_utf8_listing() {
        assert!(matches!(
            parse_list_response(&[0xff, 0xfe, 0x00]),
            Err(StorageError::Decode(_))
        ));
    }

    #[test]
    fn uri_encoding_follows_s3_rules() {
        assert_eq!(uri_encode("imagens/a b.webp", false), "imagens/a%20b.webp");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("safe-chars._~", true), "safe-chars._~");
    }

    #[test]
    fn canonical_query_is_sorted() {
        let params = vec![
            ("prefix".to_string(), "imagens/".to_string()),
            ("list-type".to_string(), "2".to_string()),
        ];
        assert_eq!(
            canonical_query_string(&params),
            "list-type=2&prefix=imagens%2F"
        );
    }
}
