//! Service-call steps: registry lookup, health gating, secret header
//! resolution, templated request building, and the retrying HTTP call.

use crate::error::{Error, Result};
use crate::secrets::SecretStore;
use crate::storage::records::RecordStore;
use crate::template::{expand_string, expand_value, TemplateScope};
use crate::types::{
    HeaderValueSpec, RetryPolicy, ServiceHealth, ServiceRecord, ServiceStep,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Result of a completed service call
#[derive(Debug, Clone)]
pub struct ServiceCallOutcome {
    pub ok: bool,
    pub status_code: u16,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
    pub attempts: u32,
    pub url: String,
}

impl ServiceCallOutcome {
    /// Shape persisted into `context.shared` by `storeResponseAs`.
    pub fn capture(&self) -> Value {
        json!({
            "ok": self.ok,
            "statusCode": self.status_code,
            "body": self.body,
            "headers": self.headers,
        })
    }
}

/// Gate a service's current health against the step's expectations.
fn check_health(step: &ServiceStep, service: &ServiceRecord) -> Result<()> {
    let require_healthy = step.require_healthy.unwrap_or(false);
    let allow_degraded = step.allow_degraded.unwrap_or(false);

    match service.status {
        ServiceHealth::Healthy => Ok(()),
        ServiceHealth::Degraded if allow_degraded && !require_healthy => Ok(()),
        ServiceHealth::Degraded => Err(Error::ServiceUnavailable {
            slug: service.slug.clone(),
            reason: "service is degraded".to_string(),
        }),
        ServiceHealth::Unreachable => Err(Error::ServiceUnavailable {
            slug: service.slug.clone(),
            reason: "service is unreachable".to_string(),
        }),
    }
}

/// Resolve header specs into (actual, redacted) maps. Secret values
/// never reach the redacted map; `Authorization` is always masked.
fn resolve_headers(
    step: &ServiceStep,
    secrets: &dyn SecretStore,
    scope: &TemplateScope,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
    let mut actual = BTreeMap::new();
    let mut redacted = BTreeMap::new();

    for (name, spec) in &step.request.headers {
        let (value, mask) = match spec {
            HeaderValueSpec::Literal(text) => (expand_string(text, scope), false),
            HeaderValueSpec::Secret { secret, prefix } => {
                let resolved = secrets.resolve(secret).ok_or_else(|| {
                    Error::ServiceUnavailable {
                        slug: step.service_slug.clone(),
                        reason: format!("secret '{}' for header '{name}' is missing", secret.key),
                    }
                })?;
                let value = match prefix {
                    Some(prefix) => format!("{prefix}{resolved}"),
                    None => resolved,
                };
                (value, true)
            }
        };

        let masked = mask || name.eq_ignore_ascii_case("authorization");
        redacted.insert(
            name.clone(),
            if masked { "***".to_string() } else { value.clone() },
        );
        actual.insert(name.clone(), value);
    }

    Ok((actual, redacted))
}

/// Build the request URL from the service base and the templated path
/// and query.
fn build_url(
    service: &ServiceRecord,
    step: &ServiceStep,
    scope: &TemplateScope,
) -> (String, Vec<(String, String)>) {
    let path = expand_string(&step.request.path, scope);
    let base = service.base_url.trim_end_matches('/');
    let url = if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    let query: Vec<(String, String)> = step
        .request
        .query
        .iter()
        .map(|(k, v)| (k.clone(), expand_string(v, scope)))
        .collect();
    (url, query)
}

/// Invoke a service step: health gate, templating, retry policy around
/// non-2xx responses. Returns the outcome and the redacted input
/// record persisted with the run step.
pub async fn invoke_service_step(
    http: &reqwest::Client,
    store: &dyn RecordStore,
    secrets: &dyn SecretStore,
    step: &ServiceStep,
    scope: &TemplateScope,
) -> Result<(ServiceCallOutcome, Value)> {
    let service = store
        .get_service(&step.service_slug)
        .await?
        .ok_or_else(|| Error::ServiceUnavailable {
            slug: step.service_slug.clone(),
            reason: "service is not registered".to_string(),
        })?;

    check_health(step, &service)?;

    let (headers, redacted_headers) = resolve_headers(step, secrets, scope)?;
    let (url, query) = build_url(&service, step, scope);
    let body = step
        .request
        .body
        .as_ref()
        .map(|body| expand_value(body, scope));

    let input_record = json!({
        "serviceSlug": step.service_slug,
        "request": {
            "method": step.request.method.as_str(),
            "url": url,
            "query": query.iter().cloned().collect::<BTreeMap<_, _>>(),
            "headers": redacted_headers,
            "body": body,
        },
    });

    let policy = step.retry_policy.clone().unwrap_or(RetryPolicy {
        max_attempts: 1,
        strategy: crate::types::RetryStrategy::Fixed,
        initial_delay_ms: 0,
        max_delay_ms: None,
        jitter: None,
    });
    let max_attempts = policy.max_attempts.max(1);

    let method = reqwest::Method::from_bytes(step.request.method.as_str().as_bytes())
        .expect("statically known methods are valid");

    let mut last_error: Option<Error> = None;
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_before_attempt(attempt)).await;
        }

        let mut request = http.request(method.clone(), url.as_str()).query(&query);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let response_headers: BTreeMap<String, String> = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect();
                let capture = step.capture_response.unwrap_or(false)
                    || step.store_response_as.is_some();
                let body_value = if capture {
                    response.json::<Value>().await.unwrap_or(Value::Null)
                } else {
                    Value::Null
                };

                if status.is_success() {
                    return Ok((
                        ServiceCallOutcome {
                            ok: true,
                            status_code: status.as_u16(),
                            body: body_value,
                            headers: response_headers,
                            attempts: attempt,
                            url,
                        },
                        input_record,
                    ));
                }

                tracing::warn!(
                    service = %step.service_slug,
                    status = status.as_u16(),
                    attempt,
                    "service call returned an error status"
                );
                last_error = Some(Error::ServiceHttp {
                    status: status.as_u16(),
                });
            }
            Err(e) => {
                tracing::warn!(service = %step.service_slug, attempt, error = %e, "service call failed");
                last_error = Some(Error::ServiceUnavailable {
                    slug: step.service_slug.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(last_error.unwrap_or(Error::ServiceHttp { status: 0 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::InProcessSecretStore;
    use crate::storage::RedbRecordStore;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_with_service(base_url: &str, status: ServiceHealth) -> (TempDir, RedbRecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path().join("records.redb")).unwrap();
        store
            .put_service(ServiceRecord {
                slug: "billing".to_string(),
                base_url: base_url.to_string(),
                status,
                metadata: json!({}),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        (dir, store)
    }

    fn service_step(value: Value) -> ServiceStep {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn retries_until_success_and_redacts_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoices/acme"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/invoices/acme"))
            .and(header("Authorization", "Bearer tok-99"))
            .and(query_param("limit", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"invoiced": true})))
            .mount(&server)
            .await;

        let (_dir, store) = store_with_service(&server.uri(), ServiceHealth::Healthy).await;
        let secrets = InProcessSecretStore::new();
        secrets.seed("billing-token", "tok-99");

        let step = service_step(json!({
            "id": "invoice",
            "serviceSlug": "billing",
            "request": {
                "path": "/invoices/{{ parameters.tenant }}",
                "method": "POST",
                "headers": {
                    "Authorization": {"secret": {"source": "store", "key": "billing-token"}, "prefix": "Bearer "},
                    "Content-Type": "application/json"
                },
                "query": {"limit": "{{ parameters.limit }}"},
                "body": {"tenant": "{{ parameters.tenant }}"}
            },
            "captureResponse": true,
            "retryPolicy": {"maxAttempts": 2, "strategy": "fixed", "initialDelayMs": 10}
        }));
        let scope = TemplateScope::new(json!({"parameters": {"tenant": "acme", "limit": 25}}));

        let (outcome, input) =
            invoke_service_step(&reqwest::Client::new(), &store, &secrets, &step, &scope)
                .await
                .unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.body["invoiced"], true);
        assert_eq!(input["request"]["headers"]["Authorization"], "***");
        assert_eq!(input["request"]["headers"]["Content-Type"], "application/json");
        assert_eq!(input["request"]["body"]["tenant"], "acme");
    }

    #[tokio::test]
    async fn degraded_service_fails_without_allow_degraded() {
        let (_dir, store) = store_with_service("http://127.0.0.1:9", ServiceHealth::Degraded).await;
        let secrets = InProcessSecretStore::new();

        let step = service_step(json!({
            "id": "call",
            "serviceSlug": "billing",
            "request": {"path": "/ping", "method": "GET"}
        }));
        let scope = TemplateScope::new(json!({}));

        let err = invoke_service_step(&reqwest::Client::new(), &store, &secrets, &step, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn degraded_service_passes_with_allow_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pong": true})))
            .mount(&server)
            .await;

        let (_dir, store) = store_with_service(&server.uri(), ServiceHealth::Degraded).await;
        let secrets = InProcessSecretStore::new();

        let step = service_step(json!({
            "id": "call",
            "serviceSlug": "billing",
            "allowDegraded": true,
            "captureResponse": true,
            "request": {"path": "/ping", "method": "GET"}
        }));
        let scope = TemplateScope::new(json!({}));

        let (outcome, _input) =
            invoke_service_step(&reqwest::Client::new(), &store, &secrets, &step, &scope)
                .await
                .unwrap();
        assert_eq!(outcome.body["pong"], true);
    }

    #[tokio::test]
    async fn unknown_service_is_unavailable_without_a_request() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path().join("records.redb")).unwrap();
        let secrets = InProcessSecretStore::new();

        let step = service_step(json!({
            "id": "call",
            "serviceSlug": "ghost",
            "request": {"path": "/", "method": "GET"}
        }));

        let err = invoke_service_step(
            &reqwest::Client::new(),
            &store,
            &secrets,
            &step,
            &TemplateScope::new(json!({})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn missing_secret_header_fails_before_the_request() {
        let (_dir, store) = store_with_service("http://127.0.0.1:9", ServiceHealth::Healthy).await;
        let secrets = InProcessSecretStore::new();

        let step = service_step(json!({
            "id": "call",
            "serviceSlug": "billing",
            "request": {
                "path": "/",
                "method": "GET",
                "headers": {"X-Token": {"secret": {"source": "store", "key": "absent"}}}
            }
        }));

        let err = invoke_service_step(
            &reqwest::Client::new(),
            &store,
            &secrets,
            &step,
            &TemplateScope::new(json!({})),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (_dir, store) = store_with_service(&server.uri(), ServiceHealth::Healthy).await;
        let step = service_step(json!({
            "id": "call",
            "serviceSlug": "billing",
            "request": {"path": "/flaky", "method": "GET"},
            "retryPolicy": {"maxAttempts": 3, "strategy": "fixed", "initialDelayMs": 5}
        }));

        let err = invoke_service_step(
            &reqwest::Client::new(),
            &store,
            &InProcessSecretStore::new(),
            &step,
            &TemplateScope::new(json!({})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ServiceHttp { status: 503 }));
    }
}
