use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::sigv4::{MAX_PRESIGN_EXPIRES_SECONDS, aws_percent_encode};
use crate::auth::{SigV4Signer, SigV4Timestamp, SigningError};
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::services::StorageBackend;
use crate::types::{CrawlFile, Organization};
use crate::{LedgerError, Result};

/// S3-compatible object storage addressed path-style:
/// `{endpoint}/{bucket}/{key_prefix}/{org_id}/{filename}`.
pub struct S3Storage {
    http: reqwest::Client,
    signer: SigV4Signer,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
}

impl S3Storage {
    pub fn new(
        config: StorageConfig,
        signer: SigV4Signer,
    ) -> std::result::Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            signer,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn object_key(&self, org: &Organization, file: &CrawlFile) -> String {
        let prefix = self.config.key_prefix.trim_matches('/');
        let filename = file.filename.trim_start_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", org.id, filename)
        } else {
            format!("{prefix}/{}/{filename}", org.id)
        }
    }

    pub fn object_url(&self, org: &Organization, file: &CrawlFile) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint_url.trim_end_matches('/'),
            self.config.bucket,
            aws_percent_encode(&self.object_key(org, file), false)
        )
    }

    fn timestamp(&self) -> std::result::Result<SigV4Timestamp, SigningError> {
        SigV4Timestamp::from_datetime(self.clock.now())
    }

    fn public_url(&self, signed: String) -> String {
        let Some(access) = self.config.access_endpoint_url.as_deref() else {
            return signed;
        };
        let endpoint = self.config.endpoint_url.trim_end_matches('/');
        match signed.strip_prefix(endpoint) {
            Some(rest) => format!("{}{rest}", access.trim_end_matches('/')),
            None => signed,
        }
    }
}

fn signing_failed(err: SigningError) -> LedgerError {
    tracing::warn!(error = %err, "s3 request signing failed");
    LedgerError::upstream("storage_signing_failed")
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn delete_object(&self, org: &Organization, file: &CrawlFile) -> Result<bool> {
        let url = self.object_url(org, file);
        let signed = self
            .timestamp()
            .and_then(|ts| self.signer.sign("DELETE", &url, &BTreeMap::new(), b"", ts))
            .map_err(signing_failed)?;

        let response = match signed.headers.apply(self.http.delete(&url)).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    org_id = %org.id,
                    filename = %file.filename,
                    error = %err,
                    "s3 delete request failed"
                );
                return Ok(false);
            }
        };
        let status = response.status();
        if status.is_success() {
            tracing::debug!(org_id = %org.id, filename = %file.filename, "s3 object deleted");
            return Ok(true);
        }
        tracing::warn!(
            org_id = %org.id,
            filename = %file.filename,
            status = status.as_u16(),
            "s3 delete rejected"
        );
        Ok(false)
    }

    async fn mint_signed_url(
        &self,
        org: &Organization,
        file: &CrawlFile,
        ttl_seconds: u64,
    ) -> Result<String> {
        let url = self.object_url(org, file);
        let expires = ttl_seconds.clamp(1, MAX_PRESIGN_EXPIRES_SECONDS);
        let presigned = self
            .timestamp()
            .and_then(|ts| self.signer.presign_url("GET", &url, expires, ts))
            .map_err(signing_failed)?;
        Ok(self.public_url(presigned.url))
    }
}
