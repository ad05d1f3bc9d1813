//! HTTP range fetcher.

use std::time::Duration;

use tracing::trace;

use crate::TransferError;
use crate::remote::{BoxFuture, RangeFetcher};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches byte ranges with HTTP `Range: bytes=start-end` requests.
///
/// Dropping the returned future aborts the request.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl RangeFetcher for HttpRangeFetcher {
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        let url = url.to_string();
        Box::pin(async move {
            trace!(%url, start, end_inclusive, "fetching range");
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::RANGE, format!("bytes={start}-{end_inclusive}"))
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| TransferError::Disconnected(format!("range request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransferError::Remote(format!(
                    "range {start}-{end_inclusive} returned status {status}"
                )));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| TransferError::Disconnected(format!("failed to read range body: {e}")))?;
            Ok(body.to_vec())
        })
    }
}
