//! Byte transport for asset downloads.
//!
//! Components take a [`Transport`] instead of talking to `reqwest` directly,
//! so retry policy ([`RetryTransport`]) and test doubles slot in from outside.
use futures_util::TryStreamExt;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, Seek, Write};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TransportError {
    /// Connection problems, timeouts, throttling and server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub trait Transport {
    /// Writes the resource at `url` into `sink` and returns the byte count.
    async fn fetch_to(&self, url: &Url, sink: &mut File) -> Result<u64, TransportError>;
}

impl<T: Transport> Transport for &T {
    async fn fetch_to(&self, url: &Url, sink: &mut File) -> Result<u64, TransportError> {
        (**self).fetch_to(url, sink).await
    }
}

/// HTTP(S) via `reqwest`; `file://` URLs are copied from local disk.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    async fn fetch_to(&self, url: &Url, sink: &mut File) -> Result<u64, TransportError> {
        if url.scheme() == "file" {
            let path = url.to_file_path().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("Not a local path: {url}"))
            })?;
            let mut source = File::open(path)?;
            let written = io::copy(&mut source, sink)?;
            sink.flush()?;
            return Ok(written);
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(bytes) = body.try_next().await? {
            sink.write_all(&bytes)?;
            written += bytes.len() as u64;
        }
        sink.flush()?;
        Ok(written)
    }
}

/// Retries retryable failures with exponential backoff, truncating the
/// sink before each new attempt.
#[derive(Debug, Clone)]
pub struct RetryTransport<T> {
    inner: T,
    max_attempts: u32,
    backoff: Duration,
}

impl<T> RetryTransport<T> {
    pub fn new(inner: T, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Transport> Transport for RetryTransport<T> {
    async fn fetch_to(&self, url: &Url, sink: &mut File) -> Result<u64, TransportError> {
        let mut attempt = 1;
        loop {
            match self.inner.fetch_to(url, sink).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Attempt {attempt}/{} for {url} failed: {e}; retrying in {delay:?}",
                        self.max_attempts
                    );
                    sink.set_len(0)?;
                    sink.rewind()?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("Giving up on {url} after {attempt} attempt(s)");
                    return Err(e);
                }
            }
        }
    }
}
