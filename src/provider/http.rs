//! HTTP provider plugin.
//!
//! Speaks a small REST protocol to an external provider process:
//!
//! - `GET /schema` returns the [`ProviderSchema`]
//! - `POST /resources/{kind}` creates an object
//! - `GET /resources/{kind}/{id}` reads it
//! - `PATCH /resources/{kind}/{id}` updates it
//! - `DELETE /resources/{kind}/{id}` destroys it
//!
//! Object bodies are `{"id": ..., "attributes": {...}}`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigParser, ProviderConfig};
use crate::error::{ConfigError, HalldyllError, ProviderError, ProviderResult, Result};
use crate::graph::Attributes;

use super::{CreatedResource, DestroyOutcome, Provider, ProviderSchema};

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 500;

/// Upper bound on a server-requested retry delay.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Provider plugin reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// Provider name.
    name: String,
    /// Base URL; resource segments are appended to its path.
    endpoint: Url,
    /// HTTP client.
    client: Client,
    /// Bearer token, if configured.
    token: Option<String>,
    /// Schema fetched at connect time.
    schema: ProviderSchema,
}

/// Request body for create and update.
#[derive(Debug, Serialize)]
struct AttributesBody<'a> {
    attributes: &'a Attributes,
}

/// Object returned by the plugin.
#[derive(Debug, Deserialize)]
struct ObjectBody {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

/// Error body returned by the plugin.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

impl HttpProvider {
    /// Creates a provider without contacting it. The schema starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a base URL or the HTTP
    /// client cannot be created.
    pub fn new(
        name: impl Into<String>,
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ConfigError::validation(
                    format!("'{endpoint}' is not a base URL"),
                    "provider.endpoint",
                )
            })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            endpoint,
            client,
            token,
            schema: ProviderSchema::new(),
        })
    }

    /// Builds the provider from its configuration and fetches its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the token variable is missing or the schema
    /// cannot be fetched.
    pub async fn connect(config: &ProviderConfig) -> Result<Self> {
        let token = match &config.token_env {
            Some(var) => Some(ConfigParser::get_token(var)?),
            None => None,
        };

        let mut provider = Self::new(
            config.name.clone(),
            &config.endpoint,
            token,
            Duration::from_secs(config.timeout_secs),
        )?;
        provider.refresh_schema().await?;

        info!(
            "Connected to provider '{}' at {} ({} kinds)",
            provider.name,
            provider.endpoint,
            provider.schema.kinds.len()
        );
        Ok(provider)
    }

    /// Fetches the schema from the plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a schema.
    pub async fn refresh_schema(&mut self) -> Result<()> {
        let response = self
            .send_with_retry(true, || self.request(Method::GET, &["schema"]))
            .await?;
        let response = Self::check_status(response).await?;
        self.schema = Self::parse_json(response).await.map_err(HalldyllError::from)?;
        Ok(())
    }

    /// Appends path segments to the endpoint, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.url(segments))
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
    }

    /// Sends a request, retrying rate limits and network failures.
    ///
    /// A non-idempotent request is only retried on a rate limit, which the
    /// plugin answers before doing any work.
    async fn send_with_retry<F>(&self, idempotent: bool, build: F) -> ProviderResult<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if let Some(err) = &last_error {
                let delay = match err {
                    ProviderError::RateLimited { retry_after_secs } => {
                        Duration::from_secs((*retry_after_secs).min(MAX_RETRY_AFTER_SECS))
                    }
                    _ => Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt)),
                };
                debug!("Retry attempt {attempt} of {MAX_RETRIES} after {delay:?}");
                tokio::time::sleep(delay).await;
            }

            match self.send_once(build()).await {
                Ok(response) => return Ok(response),
                Err(e) if Self::should_retry(&e, idempotent) => {
                    warn!("Provider '{}' call failed, retrying: {e}", self.name);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded")))
    }

    const fn should_retry(error: &ProviderError, idempotent: bool) -> bool {
        match error {
            ProviderError::RateLimited { .. } => true,
            _ => idempotent && error.is_retryable(),
        }
    }

    async fn send_once(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        trace!("Provider '{}' answered {}", self.name, response.status());

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if response.status().is_server_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::network(format!("Server error {status}: {body}")));
        }

        Ok(response)
    }

    /// Maps non-success statuses to provider errors.
    async fn check_status(response: Response) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);

        Err(match status.as_u16() {
            401 | 403 => ProviderError::AuthenticationFailed { message },
            409 => ProviderError::Conflict { message },
            code => ProviderError::rejected(code, message),
        })
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }

    fn not_found(kind: &str, id: &str) -> ProviderError {
        ProviderError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ProviderSchema {
        self.schema.clone()
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<CreatedResource> {
        let body = AttributesBody { attributes };
        let response = self
            .send_with_retry(false, || {
                self.request(Method::POST, &["resources", kind]).json(&body)
            })
            .await?;
        let object: ObjectBody = Self::parse_json(Self::check_status(response).await?).await?;

        debug!("Created {kind} '{}'", object.id);
        Ok(CreatedResource {
            id: object.id,
            attributes: object.attributes,
        })
    }

    async fn read(&self, kind: &str, id: &str) -> ProviderResult<Option<Attributes>> {
        let response = self
            .send_with_retry(true, || self.request(Method::GET, &["resources", kind, id]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let object: ObjectBody = Self::parse_json(Self::check_status(response).await?).await?;
        Ok(Some(object.attributes))
    }

    async fn update(&self, kind: &str, id: &str, changed: &Attributes) -> ProviderResult<Attributes> {
        let body = AttributesBody { attributes: changed };
        let response = self
            .send_with_retry(true, || {
                self.request(Method::PATCH, &["resources", kind, id]).json(&body)
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Self::not_found(kind, id));
        }
        let object: ObjectBody = Self::parse_json(Self::check_status(response).await?).await?;
        Ok(object.attributes)
    }

    async fn destroy(&self, kind: &str, id: &str) -> ProviderResult<DestroyOutcome> {
        let response = self
            .send_with_retry(true, || self.request(Method::DELETE, &["resources", kind, id]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DestroyOutcome::NotFound);
        }
        Self::check_status(response).await?;
        Ok(DestroyOutcome::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(
            "test",
            &server.uri(),
            Some(String::from("secret")),
            Duration::from_secs(5),
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn test_refresh_schema() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kinds": {
                    "net": {"replace_on_change": ["cidr"]},
                    "vm": {"replace_strategy": "create_before_destroy"}
                }
            })))
            .mount(&server)
            .await;

        let mut provider = provider(&server);
        provider.refresh_schema().await.expect("schema loads");

        let schema = provider.schema();
        assert!(schema.requires_replacement("net", "cidr"));
        assert!(schema.supports("vm"));
    }

    #[tokio::test]
    async fn test_create_sends_token_and_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/net"))
            .and(header_eq("authorization", "Bearer secret"))
            .and(body_json(json!({"attributes": {"cidr": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "net-123",
                "attributes": {"cidr": "10.0.0.0/16", "arn": "arn:net-123"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));

        let created = provider(&server)
            .create("net", &attributes)
            .await
            .expect("create succeeds");
        assert_eq!(created.id, "net-123");
        assert_eq!(created.attributes.get("arn"), Some(&json!("arn:net-123")));
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/net/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let read = provider(&server).read("net", "gone").await.expect("read ok");
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_destroy_not_found_is_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/vm/i-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = provider(&server).destroy("vm", "i-1").await.expect("destroy ok");
        assert_eq!(outcome, DestroyOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/resources/vm/i-1"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"message": "in use"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/vm"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad size"))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let err = provider
            .update("vm", "i-1", &Attributes::new())
            .await
            .expect_err("conflict");
        assert_eq!(err.kind(), ProviderErrorKind::Conflict);

        let err = provider
            .create("vm", &Attributes::new())
            .await
            .expect_err("rejected");
        assert!(matches!(err, ProviderError::Rejected { status: 422, ref message } if message == "bad size"));
    }

    #[tokio::test]
    async fn test_create_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/vm"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream reset"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .create("vm", &Attributes::new())
            .await
            .expect_err("server error surfaces");
        assert!(matches!(err, ProviderError::NetworkError { .. }));
    }

    #[tokio::test]
    async fn test_create_retries_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/vm"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/vm"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "i-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create("vm", &Attributes::new())
            .await
            .expect("create succeeds");
        assert_eq!(created.id, "i-1");
    }

    #[tokio::test]
    async fn test_ids_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/resources/vm/zone%2Fa%3Fforce=1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            "test",
            &format!("{}/api/", server.uri()),
            None,
            Duration::from_secs(5),
        )
        .expect("client builds");
        let outcome = provider
            .destroy("vm", "zone/a?force=1")
            .await
            .expect("destroy ok");
        assert_eq!(outcome, DestroyOutcome::Destroyed);
    }

    #[test]
    fn test_rejects_non_base_endpoint() {
        let err = HttpProvider::new("test", "mailto:ops@example.com", None, Duration::from_secs(1))
            .expect_err("not a base url");
        assert!(matches!(
            err,
            HalldyllError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "provider.endpoint"
        ));
    }

    #[tokio::test]
    async fn test_retries_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/net/n-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/net/n-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "n-1",
                "attributes": {"cidr": "10.0.0.0/16"}
            })))
            .mount(&server)
            .await;

        let read = provider(&server).read("net", "n-1").await.expect("read ok");
        assert_eq!(
            read.and_then(|a| a.get("cidr").cloned()),
            Some(json!("10.0.0.0/16"))
        );
    }
}
