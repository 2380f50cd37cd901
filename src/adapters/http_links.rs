//! HTTP link resolver.
//!
//! Sends HEAD, falling back to GET for servers that reject or stall on
//! HEAD. Both requests share the caller's timeout: HEAD gets half of it and
//! GET whatever is left. Redirects are followed by the client; the final
//! status is returned.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use super::{LinkResolver, ProbeError};

const USER_AGENT: &str = concat!("docsqa-linkcheck/", env!("CARGO_PKG_VERSION"));

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 10;

pub struct HttpLinkResolver {
    client: reqwest::Client,
}

impl HttpLinkResolver {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_builder(reqwest::Client::builder())
    }

    fn from_builder(builder: reqwest::ClientBuilder) -> anyhow::Result<Self> {
        let client = builder
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, method: Method, url: &str, timeout: Duration) -> Result<StatusCode, ProbeError> {
        self.client
            .request(method, url)
            .timeout(timeout)
            .send()
            .await
            .map(|r| r.status())
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Unreachable(e.to_string())
                }
            })
    }
}

#[async_trait]
impl LinkResolver for HttpLinkResolver {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError> {
        let started = Instant::now();
        match self.send(Method::HEAD, url, timeout / 2).await {
            Ok(status) if !needs_get(status) => return Ok(status.as_u16()),
            Ok(_) | Err(ProbeError::Timeout) => {}
            Err(e) => return Err(e),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }
        Ok(self.send(Method::GET, url, remaining).await?.as_u16())
    }
}

/// Statuses servers answer HEAD with when only GET is supported
fn needs_get(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED | StatusCode::FORBIDDEN
    )
}
