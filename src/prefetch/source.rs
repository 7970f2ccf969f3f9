//! Where prefetched bytes come from.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};

use crate::config::UpstreamConfig;
use crate::error::FetchError;

/// A stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Data returned by a [`ContiguousDataSource`].
pub struct ContiguousData {
    pub stream: ByteStream,
    /// Declared length, when the source knows it up front.
    pub size: Option<u64>,
}

impl std::fmt::Debug for ContiguousData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContiguousData")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Anything that can produce the contiguous bytes of an item by id.
#[async_trait]
pub trait ContiguousDataSource: Send + Sync {
    async fn get_data(&self, id: &str) -> Result<ContiguousData, FetchError>;
}

/// Streams items from a trusted upstream gateway at `{base_url}/raw/{id}`.
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpDataSource {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    fn url(&self, id: &str) -> String {
        format!("{}/raw/{id}", self.base_url)
    }
}

#[async_trait]
impl ContiguousDataSource for HttpDataSource {
    async fn get_data(&self, id: &str) -> Result<ContiguousData, FetchError> {
        let url = self.url(id);
        tracing::debug!(id, url = %url, "Fetching from upstream");

        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }

        let size = resp.content_length();
        let owned_id = id.to_string();
        let stream = resp
            .bytes_stream()
            .map_err(move |e| FetchError::Stream {
                id: owned_id.clone(),
                reason: e.to_string(),
            })
            .boxed();

        Ok(ContiguousData { stream, size })
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;

    async fn upstream() -> String {
        let app = Router::new().route(
            "/raw/{id}",
            get(|Path(id): Path<String>| async move {
                if id == "missing" {
                    Err(StatusCode::NOT_FOUND)
                } else {
                    Ok(format!("body of {id}"))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/")
    }

    fn source(base_url: String) -> HttpDataSource {
        HttpDataSource::new(&UpstreamConfig {
            base_url,
            request_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn url_strips_trailing_slash() {
        let src = source("https://example.net/".into());
        assert_eq!(src.url("abc"), "https://example.net/raw/abc");
    }

    #[tokio::test]
    async fn streams_upstream_body() {
        let src = source(upstream().await);
        let data = src.get_data("abc").await.unwrap();
        assert_eq!(data.size, Some(11));

        let chunks: Vec<Bytes> = data.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"body of abc");
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let src = source(upstream().await);
        let err = src.get_data("missing").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_request_error() {
        let src = source("http://127.0.0.1:1".into());
        let err = src.get_data("abc").await.unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }
}
