//! Upstream HTTP client: pooled `reqwest::Client` plus the retry/backoff
//! policy in [`super::retry_policy`].
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::GatewayError;

use super::retry_policy::{
    retry_delay, retry_transport_delay, should_retry_transport_message,
    should_retry_upstream_status, RETRY_MAX_ATTEMPTS,
};

/// Thin wrapper around a pooled [`reqwest::Client`] that retries retriable
/// upstream statuses and transport errors before giving up.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport from the server's pool/timeout configuration.
    ///
    /// Falls back to an unconfigured default client if the configured
    /// settings somehow fail to build (never observed in practice, but
    /// cheaper than propagating a builder error through every call site).
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.http_pool_max_idle_per_host.max(1))
            .pool_idle_timeout(pool_idle_timeout)
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to build configured HTTP client, falling back to default");
                reqwest::Client::new()
            });
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, retrying retriable upstream statuses/transport
    /// errors per [`super::retry_policy`]. Used for both non-streaming
    /// sends and streaming sends (the caller reads the body as a stream
    /// either way; retries only ever apply before any bytes are read).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] on a client-side timeout and
    /// [`GatewayError::Unavailable`] for any other transport failure once
    /// retries are exhausted.
    pub async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, GatewayError> {
        let mut attempt = 0;
        loop {
            let Some(cloned) = request.try_clone() else {
                return self.send_once(request).await;
            };
            match self.client.execute(cloned).await {
                Ok(response) => {
                    if attempt < RETRY_MAX_ATTEMPTS && should_retry_upstream_status(response.status()) {
                        let delay = retry_delay(response.headers(), attempt);
                        tracing::debug!(
                            status = response.status().as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if err.is_timeout() {
                        return Err(GatewayError::Timeout);
                    }
                    let message = err.to_string();
                    if attempt >= RETRY_MAX_ATTEMPTS || !should_retry_transport_message(&message) {
                        return Err(GatewayError::Unavailable);
                    }
                    let delay = retry_transport_delay(&message, attempt);
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(&self, request: reqwest::Request) -> Result<reqwest::Response, GatewayError> {
        match self.client.execute(request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_timeout() => Err(GatewayError::Timeout),
            Err(_) => Err(GatewayError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let transport = HttpTransport::new(&ServerConfig::default());
        assert!(transport.client().get("http://127.0.0.1").build().is_ok());
    }
}
