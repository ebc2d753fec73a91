//! Download-size enrichment with bounded retries.

use std::sync::Arc;

use appsync_core::text::one_decimal;
use appsync_providers::{ProbeError, SizeProvider};
use thiserror::Error;
use tracing::{info, warn};

use crate::retry::{RetryError, RetryPolicy};

pub const UNKNOWN_SIZE: &str = "Unknown";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("permanent size probe failure: {0}")]
    Permanent(ProbeError),
    #[error("size probe failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: ProbeError },
    #[error("size probe failed: {0}")]
    Unknown(ProbeError),
}

impl From<RetryError<ProbeError>> for EnrichmentError {
    fn from(err: RetryError<ProbeError>) -> Self {
        match err {
            RetryError::Permanent(e) => EnrichmentError::Permanent(e),
            RetryError::Exhausted { attempts, last } => {
                EnrichmentError::RetriesExhausted { attempts, last }
            }
            RetryError::Unknown(e) => EnrichmentError::Unknown(e),
        }
    }
}

/// Renders a byte count as `"{n}MB"` below 1000 MB and `"{n.n}GB"` above.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return UNKNOWN_SIZE.to_string();
    }
    let mb = (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    if mb >= 1000.0 {
        format!("{}GB", one_decimal(mb / 1000.0))
    } else {
        format!("{}MB", mb.floor() as u64)
    }
}

pub struct EnrichmentRetrier {
    provider: Arc<dyn SizeProvider>,
    policy: RetryPolicy,
}

impl EnrichmentRetrier {
    pub fn new(provider: Arc<dyn SizeProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// Probes the download size, retrying throttling and timeouts only.
    pub async fn fetch_size(&self, app_id: &str) -> Result<String, EnrichmentError> {
        let bytes = self
            .policy
            .run(
                |attempt| {
                    if attempt > 0 {
                        info!(app_id, attempt, "retrying size probe");
                    }
                    self.provider.probe(app_id)
                },
                ProbeError::disposition,
            )
            .await
            .map_err(|err| {
                let err = EnrichmentError::from(err);
                warn!(app_id, error = %err, "size enrichment failed");
                err
            })?;
        Ok(format_size(bytes))
    }
}

/// Size to write for a new record; `None` means the insert must be skipped.
pub fn size_for_insert(result: Result<String, EnrichmentError>) -> Option<String> {
    result.ok()
}

/// Size to write on update; a failed probe keeps what is stored.
pub fn size_for_update(result: Result<String, EnrichmentError>, previous: &str) -> String {
    match result {
        Ok(size) => size,
        Err(_) if previous.is_empty() => UNKNOWN_SIZE.to_string(),
        Err(_) => previous.to_string(),
    }
}
