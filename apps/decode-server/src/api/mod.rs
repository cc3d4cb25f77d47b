pub mod jobs;
pub mod lessons;
pub mod meta;
pub mod warehouse;

use crate::responses::ApiError;

/// Run filesystem or database work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
