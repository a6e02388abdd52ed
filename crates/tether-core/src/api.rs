//! External metadata API collaborator interface.

use async_trait::async_trait;

use crate::error::ApiResult;
use crate::metadata::ConnectionMetadata;

/// The external API used to fetch bootstrap connection metadata.
///
/// The core never retries this call itself; retrying the connect sequence is
/// the session manager's job, governed by its backoff policy.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Fetches fresh connection metadata from the service.
    async fn fetch_connection_metadata(&self) -> ApiResult<ConnectionMetadata>;
}
