//! Remote layer-cache pull/push.
//!
//! Cache images live in ordinary registries, tagged with the step's cache
//! key. Pull failures are soft (the step just executes); push failures are
//! the stage's problem.

use kiln_oci::transport::{PullOptions, PushOptions, RetryPolicy, Transport};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// The registry reference for a cache repo + key.
pub fn cache_reference(repo: &str, key_hex: &str) -> String {
    format!("{repo}:{key_hex}")
}

/// Tries to pull the cache image for `key_hex` from each source in order.
///
/// Returns the pulled image ID on the first success; `None` when every
/// source misses. Only cancellation is propagated as an error.
pub async fn pull(
    transport: &dyn Transport,
    cancel: &CancellationToken,
    sources: &[String],
    key_hex: &str,
    retry: RetryPolicy,
) -> Result<Option<String>> {
    let options = PullOptions::default();
    for source in sources {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let reference = match transport.parse_image_name(&cache_reference(source, key_hex)) {
            Ok(reference) => reference,
            Err(err) => {
                tracing::warn!(source, error = %err, "skipping unparsable cache source");
                continue;
            }
        };
        let pulled = kiln_oci::transport::with_retry(retry, cancel, || {
            transport.pull(cancel, &reference, &options)
        })
        .await;
        match pulled {
            Ok(image_id) => {
                tracing::debug!(source, key = key_hex, image_id, "remote cache hit");
                return Ok(Some(image_id));
            }
            Err(kiln_oci::Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                tracing::debug!(source, key = key_hex, error = %err, "remote cache miss");
            }
        }
    }
    Ok(None)
}

/// Pushes a committed step image to every configured cache sink.
pub async fn push(
    transport: &dyn Transport,
    cancel: &CancellationToken,
    sinks: &[String],
    image_id: &str,
    key_hex: &str,
    retry: RetryPolicy,
) -> Result<()> {
    let options = PushOptions::default();
    for sink in sinks {
        let reference = transport
            .parse_image_name(&cache_reference(sink, key_hex))
            .map_err(Error::Oci)?;
        kiln_oci::transport::with_retry(retry, cancel, || {
            transport.push(cancel, image_id, &reference, &options)
        })
        .await
        .map_err(Error::Oci)?;
        tracing::debug!(sink, key = key_hex, image_id, "pushed cache image");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reference_is_repo_colon_key() {
        assert_eq!(
            cache_reference("registry.io/team/cache", "abc123"),
            "registry.io/team/cache:abc123"
        );
    }
}
