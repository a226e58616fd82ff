use std::future::Future;
use std::time::Duration;
use uniprov_common::{ProviderError, Result};

pub mod image_lifecycle;
pub mod instance_lifecycle;
pub mod logger;
pub mod provider_manager;
pub mod settings;
pub mod state_machine;

pub use image_lifecycle::{ImageLifecycle, ImageRecord};
pub use instance_lifecycle::{InstanceLifecycle, InstanceRecord};
pub use logger::{ActionEvent, ActionLog};
pub use provider_manager::{ProviderManager, ProviderRegistry};
pub use settings::Settings;

/// Result of an informational listing. A backend that cannot be reached
/// yields no items and the failure as a warning instead of an error.
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub warning: Option<ProviderError>,
}

impl<T> Listing<T> {
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            warning: None,
        }
    }

    pub fn degraded(warning: ProviderError) -> Self {
        Self {
            items: Vec::new(),
            warning: Some(warning),
        }
    }

    /// Unreachable backends degrade; every other failure propagates.
    pub fn from_result(result: Result<Vec<T>>) -> Result<Self> {
        match result {
            Ok(items) => Ok(Self::complete(items)),
            Err(e) if e.is_retryable() => {
                tracing::warn!("⚠️ [listing] backend unreachable, returning empty listing: {}", e);
                Ok(Self::degraded(e))
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }
}

/// Bound a backend call by a caller-supplied deadline. An elapsed deadline
/// is reported as `BackendUnreachable`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(ProviderError::BackendUnreachable(format!(
            "no reply within {}s",
            deadline.as_secs_f64()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uniprov_common::ErrorKind;

    #[tokio::test]
    async fn deadline_elapsed_is_backend_unreachable() {
        let err = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProviderError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnreachable);

        let value = with_deadline(Duration::from_secs(1), async { Ok::<_, ProviderError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn only_unreachable_listings_degrade() {
        let listing = Listing::<u32>::from_result(Err(ProviderError::BackendUnreachable(
            "down".into(),
        )))
        .unwrap();
        assert!(listing.items.is_empty());
        assert!(listing.is_degraded());

        let err = Listing::<u32>::from_result(Err(ProviderError::Authentication("no".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
