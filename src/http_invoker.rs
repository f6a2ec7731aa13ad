//! `ServiceInvoker` over HTTP.
//!
//! Each invocation is POSTed as JSON to `{base_url}/{operation}`, where the
//! base URL is looked up by the step's `serviceName`. The idempotency key
//! travels in the `Idempotency-Key` header as well as in the body.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::traits::{Invocation, ServiceInvoker};
use crate::{CompensationError, StepError};

/// HTTP invoker configuration.
#[derive(Debug, Clone)]
pub struct HttpInvokerConfig {
    /// Service name to base URL
    pub services: HashMap<String, String>,

    /// Used for steps without a `serviceName`
    pub default_base_url: Option<String>,

    /// Request timeout, on top of any step timeout the engine enforces
    pub timeout: Duration,
}

impl Default for HttpInvokerConfig {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            default_base_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of one request, before it is classified for the caller
enum Failure {
    /// Nothing reached the service
    NotSent(String),
    /// The service may have applied the request
    Unknown(String),
    Status(StatusCode, String),
    /// No base URL is configured for the service
    Unroutable(String),
}

pub struct HttpInvoker {
    client: Client,
    config: HttpInvokerConfig,
}

impl HttpInvoker {
    pub fn new(config: HttpInvokerConfig) -> Result<Self, InvokerError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, invocation: &Invocation) -> Option<String> {
        let base = match invocation.service.as_deref() {
            Some(service) => self.config.services.get(service),
            None => self.config.default_base_url.as_ref(),
        }?;
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            invocation.operation.trim_start_matches('/')
        ))
    }

    /// Status codes worth another attempt
    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn post(&self, invocation: &Invocation) -> Result<Value, Failure> {
        let Some(url) = self.url(invocation) else {
            return Err(Failure::Unroutable(format!(
                "no base URL configured for service '{}'",
                invocation.service.as_deref().unwrap_or("<none>")
            )));
        };

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", invocation.idempotency_key.as_str())
            .json(invocation)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_builder() {
                    Failure::NotSent(e.to_string())
                } else {
                    Failure::Unknown(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, key = %invocation.idempotency_key, "Service call rejected");
            return Err(Failure::Status(
                status,
                format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Failure::Unknown(e.to_string()))?;
        debug!(url = %url, key = %invocation.idempotency_key, "Service call succeeded");
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Failure::Status(status, format!("response is not JSON: {e}")))
    }
}

#[async_trait]
impl ServiceInvoker for HttpInvoker {
    async fn execute(&self, invocation: Invocation) -> Result<Value, StepError> {
        self.post(&invocation).await.map_err(|failure| match failure {
            Failure::NotSent(reason) | Failure::Unknown(reason) => StepError::Retriable {
                reason: reason.into(),
            },
            Failure::Status(status, reason) if Self::is_retryable_status(status) => {
                StepError::Retriable {
                    reason: reason.into(),
                }
            }
            Failure::Status(_, reason) | Failure::Unroutable(reason) => StepError::Terminal {
                reason: reason.into(),
            },
        })
    }

    async fn compensate(&self, invocation: Invocation) -> Result<(), CompensationError> {
        self.post(&invocation)
            .await
            .map(|_| ())
            .map_err(|failure| match failure {
                Failure::NotSent(reason) => CompensationError::SafeToRetry {
                    reason: reason.into(),
                },
                Failure::Status(status, reason)
                    if status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::SERVICE_UNAVAILABLE =>
                {
                    CompensationError::SafeToRetry {
                        reason: reason.into(),
                    }
                }
                Failure::Unknown(reason) => CompensationError::Ambiguous {
                    reason: reason.into(),
                },
                Failure::Status(status, reason) if status.is_server_error() => {
                    CompensationError::Ambiguous {
                        reason: reason.into(),
                    }
                }
                Failure::Status(_, reason) | Failure::Unroutable(reason) => {
                    CompensationError::Terminal {
                        reason: reason.into(),
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepType;
    use crate::traits::InvocationKind;
    use crate::{ExecutionId, IdempotencyKey, StepContext};
    use axum::routing::post;
    use axum::{Json, Router};

    fn invocation(service: &str, operation: &str) -> Invocation {
        let context = StepContext::root(ExecutionId::new(1), "orders", 0).for_step("reserve");
        Invocation {
            idempotency_key: IdempotencyKey::for_step(ExecutionId::new(1), "reserve", 1),
            context,
            kind: InvocationKind::Forward(StepType::ServiceCall),
            service: Some(service.into()),
            operation: operation.into(),
            payload: serde_json::json!({"amount": 2}),
            timeout: None,
        }
    }

    async fn spawn_service() -> String {
        let app = Router::new()
            .route(
                "/reserve",
                post(|Json(body): Json<Value>| async move {
                    Json(serde_json::json!({"reserved": body["payload"]["amount"]}))
                }),
            )
            .route(
                "/broken",
                post(|| async { (StatusCode::BAD_REQUEST, "nope") }),
            )
            .route(
                "/flaky",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "later") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_classifies_responses() {
        let base = spawn_service().await;
        let invoker = HttpInvoker::new(HttpInvokerConfig {
            services: HashMap::from([("inventory".to_string(), base)]),
            ..Default::default()
        })
        .unwrap();

        let output = invoker.execute(invocation("inventory", "reserve")).await.unwrap();
        assert_eq!(output["reserved"], 2);

        let err = invoker.execute(invocation("inventory", "broken")).await.unwrap_err();
        assert!(!err.is_retriable());

        let err = invoker.execute(invocation("inventory", "flaky")).await.unwrap_err();
        assert!(err.is_retriable());

        let err = invoker.compensate(invocation("inventory", "flaky")).await.unwrap_err();
        assert!(err.is_safe_to_retry());

        let err = invoker.execute(invocation("billing", "charge")).await.unwrap_err();
        assert!(matches!(err, StepError::Terminal { .. }));
    }
}
