//! External collaborator ports
//!
//! Each collaborator is an async trait with an OpenAI-compatible HTTP
//! implementation. Embedding and extraction calls are always wrapped in
//! [`with_timeout`], which turns any failure into [`Error::Degradable`].

pub mod embedding;
pub mod extraction;
pub mod upstream;

pub use embedding::{Embedder, HttpEmbedder};
pub use extraction::{FactExtractor, HttpFactExtractor};
pub use upstream::{ChatUpstream, HttpUpstream, UpstreamResponse};

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Run a collaborator call with a deadline.
///
/// Timeouts and errors both come back as `Error::Degradable`.
pub async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Error::Degradable(msg))) => Err(Error::Degradable(msg)),
        Ok(Err(e)) => Err(Error::Degradable(format!("{} failed: {}", what, e))),
        Err(_) => Err(Error::Degradable(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}
