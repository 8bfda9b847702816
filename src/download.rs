//! Snapshot download from S3 compatible object storage
//!
//! Objects are addressed path-style (`<endpoint>/<bucket>/<key>`) so any S3
//! compatible store works without DNS bucket routing. Requests are signed
//! with AWS Signature Version 4 when credentials are configured and sent
//! anonymously otherwise.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{self, S3Config};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Fetches a snapshot archive to a local path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotDownloader: Send + Sync {
    /// Download `object_key` to `dest`, returning the number of bytes written.
    ///
    /// `dest` is only replaced once the whole object has been received.
    async fn download(
        &self,
        object_key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// Credentials and scope for SigV4 request signing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKey {
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
    /// Region the bucket lives in
    pub region: String,
}

impl SigningKey {
    fn scope(&self, date: &str) -> String {
        format!("{}/{}/s3/aws4_request", date, self.region)
    }

    fn derive(&self, date: &str) -> Result<Vec<u8>> {
        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, b"s3")?;
        hmac(&k_service, b"aws4_request")
    }

    /// `Authorization` header value for a request.
    ///
    /// `headers` must be lower-case names, sorted, and include every header
    /// that is sent signed (at least `host`, `x-amz-content-sha256` and
    /// `x-amz-date`).
    pub fn authorization(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        payload_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let date = at.format("%Y%m%d").to_string();
        let amz_date = amz_date(at);

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, payload_hash
        );

        let scope = self.scope(&date);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac(&self.derive(&date)?, string_to_sign.as_bytes())?);

        Ok(format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            SIGNING_ALGORITHM, self.access_key, scope, signed_headers, signature
        ))
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::download(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn amz_date(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Endpoint URL, defaulting the scheme to https
pub fn endpoint_url(endpoint: &str) -> Result<Url> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    Url::parse(&raw).map_err(|e| Error::validation(format!("invalid S3 endpoint {endpoint:?}: {e}")))
}

/// Path-style object path with every key segment percent-encoded
pub fn object_path(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/{}/{}", urlencoding::encode(bucket), encoded.join("/"))
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("S3 endpoint {url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// [`SnapshotDownloader`] for S3 compatible object storage
pub struct S3Downloader {
    client: reqwest::Client,
    config: S3Config,
    endpoint: Url,
    signing: Option<SigningKey>,
}

impl S3Downloader {
    /// Build the HTTP client for `config`
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = endpoint_url(&config.endpoint)?;

        let mut builder = reqwest::Client::builder();
        if let Some(ca_path) = &config.endpoint_ca {
            let pem = std::fs::read(ca_path)
                .map_err(|e| Error::io(format!("failed to read {}", ca_path.display()), e))?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::validation(format!("invalid S3 endpoint CA: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        if config.skip_ssl_verify {
            warn!(endpoint = %endpoint, "TLS verification disabled for S3 endpoint");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::download(format!("failed to build HTTP client: {e}")))?;

        let signing = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key))
                if !access_key.is_empty() && !secret_key.is_empty() =>
            {
                Some(SigningKey {
                    access_key: access_key.clone(),
                    secret_key: secret_key.clone(),
                    region: config.region.clone(),
                })
            }
            _ => None,
        };

        Ok(Self {
            client,
            config,
            endpoint,
            signing,
        })
    }

    /// Signed (or anonymous) GET request for `object_key`
    fn request(&self, object_key: &str, at: DateTime<Utc>) -> Result<reqwest::Request> {
        let path = object_path(&self.config.bucket, object_key);
        let mut url = self.endpoint.clone();
        url.set_path(&path);

        let mut request = self.client.get(url);
        if let Some(key) = &self.signing {
            let host = host_header(&self.endpoint)?;
            let amz_date = amz_date(at);
            let authorization = key.authorization(
                "GET",
                &path,
                &[
                    ("host", host.as_str()),
                    ("x-amz-content-sha256", UNSIGNED_PAYLOAD),
                    ("x-amz-date", amz_date.as_str()),
                ],
                UNSIGNED_PAYLOAD,
                at,
            )?;
            request = request
                .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
                .header("x-amz-date", amz_date)
                .header(reqwest::header::AUTHORIZATION, authorization);
        }

        request
            .build()
            .map_err(|e| Error::download(format!("failed to build request: {e}")))
    }

    async fn fetch(&self, object_key: &str, dest: &Path) -> Result<u64> {
        let request = self.request(object_key, Utc::now())?;
        debug!(url = %request.url(), signed = self.signing.is_some(), "Requesting snapshot object");

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| Error::download(format!("request for {object_key} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::download(format!(
                "GET {object_key} returned {status}: {}",
                body.trim()
            )));
        }

        if let Some(parent) = dest.parent() {
            config::create_dir(parent, 0o700)?;
        }
        let partial = partial_path(dest);
        let result = write_body(response, &partial).await;
        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| Error::io(format!("failed to move download to {}", dest.display()), e))?;
        Ok(written)
    }
}

async fn write_body(response: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| Error::io(format!("failed to create {}", path.display()), e))?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::download(format!("failed reading body: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| Error::io(format!("failed to flush {}", path.display()), e))?;
    Ok(written)
}

#[async_trait]
impl SnapshotDownloader for S3Downloader {
    async fn download(
        &self,
        object_key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let timeout = self.config.timeout;
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::fs::remove_file(partial_path(dest)).await;
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(timeout, self.fetch(object_key, dest)) => {
                match result {
                    Ok(result) => result?,
                    Err(_) => {
                        let _ = tokio::fs::remove_file(partial_path(dest)).await;
                        return Err(Error::timeout("snapshot download", timeout));
                    }
                }
            }
        };

        info!(
            bucket = %self.config.bucket,
            key = %object_key,
            bytes = written,
            "Downloaded snapshot object"
        );
        Ok(written)
    }
}
