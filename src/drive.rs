use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::error::DriveError;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Fetches attachment bytes for files listed in a persona's Drive inventory.
#[derive(Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
    retry_backoff: Duration,
}

impl DriveClient {
    pub fn new(http: reqwest::Client, api_base: &str, access_token: &str) -> Self {
        DriveClient {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.trim().to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn download_once(&self, file_id: &str) -> Result<Bytes, DriveError> {
        let mut request = self
            .http
            .get(format!("{}/drive/v3/files/{}", self.api_base, file_id))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .timeout(DOWNLOAD_TIMEOUT);
        if !self.access_token.is_empty() {
            request = request.bearer_auth(&self.access_token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DriveError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriveError::Status {
                status: status.as_u16(),
                file_id: file_id.to_string(),
            });
        }
        response
            .bytes()
            .await
            .map_err(|e| DriveError::Request(e.to_string()))
    }

    /// Downloads a file, trying up to three times before giving up.
    pub async fn download(&self, file_id: &str) -> Result<Bytes, DriveError> {
        let mut attempt = 1;
        loop {
            match self.download_once(file_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < DOWNLOAD_ATTEMPTS => {
                    warn!(file_id, attempt, error = %err, "drive download failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
