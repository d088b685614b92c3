//! Exponential backoff for transient store failures.

use crate::config::StorePolicy;
use crate::error::StoreError;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Run a store operation, retrying with exponential backoff.
///
/// Corrupt records fail immediately; business-rule checks never go through
/// this path.
pub async fn with_retry<T, F>(policy: &StorePolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!("{} failed (attempt {}): {}", what, attempt, e);
                debug!("Retrying {} in {:?}", what, backoff);
                sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
