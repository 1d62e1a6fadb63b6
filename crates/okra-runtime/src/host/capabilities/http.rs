//! `http` capability: a single `fetch` verb backed by `reqwest`, gated by a
//! [`crate::net::NetworkPolicy`] (scheme/port validation, TLS minimum
//! version, private-IP denial, header CRLF sanitation) before any request
//! leaves the process (§4.4).

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Value, json};

use crate::{
    error::{Error, Result},
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_size_limit, invalid_params},
    },
    net::{HttpMeta, NetworkPolicy},
};

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpCapability {
    client: reqwest::Client,
    policy: Box<dyn NetworkPolicy>,
}

impl HttpCapability {
    #[must_use]
    pub fn new(client: reqwest::Client, policy: Box<dyn NetworkPolicy>) -> Self {
        Self { client, policy }
    }

    fn build_headers(params: &Value) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(obj) = params.get("headers").and_then(Value::as_object) else {
            return Ok(headers);
        };
        for (key, value) in obj {
            let value_str = value
                .as_str()
                .ok_or_else(|| invalid_params(format!("header `{key}` must be a string")))?;
            if value_str.contains(['\r', '\n']) || key.contains(['\r', '\n']) {
                return Err(invalid_params("header names/values must not contain CRLF"));
            }
            let name = HeaderName::try_from(key.as_str())
                .map_err(|_| invalid_params(format!("invalid header name `{key}`")))?;
            let value = HeaderValue::from_str(value_str)
                .map_err(|_| invalid_params(format!("invalid header value for `{key}`")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &'static str {
        "http"
    }

    fn resource_of(&self, _method: &str, params: &Value) -> Option<String> {
        params.get("url").and_then(Value::as_str).map(ToString::to_string)
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        if method != "fetch" {
            return Err(invalid_params(format!("unknown http verb `{method}`")));
        }

        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`url` is required"))?;
        let verb = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let http_method = Method::from_bytes(verb.as_bytes())
            .map_err(|_| invalid_params(format!("invalid http method `{verb}`")))?;
        let uri: http::Uri = url.parse().map_err(|_| invalid_params(format!("invalid url `{url}`")))?;

        self.policy
            .check_http(&HttpMeta {
                method: http_method.clone(),
                uri,
            })
            .await
            .map_err(|reason| crate::error::Error::Policy(crate::error::PolicyError::Denied("http".to_string(), reason)))?;

        let headers = Self::build_headers(&params)?;
        let body = params
            .get("body")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        check_size_limit(body.len(), MAX_BODY_BYTES)?;

        let mut request = self
            .client
            .request(http_method, url)
            .timeout(DEFAULT_TIMEOUT)
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(Error::external)?;
        let status = response.status().as_u16();
        let response_headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    json!(value.to_str().unwrap_or_default()),
                )
            })
            .collect();
        let text = response.text().await.map_err(Error::external)?;
        check_size_limit(text.len(), MAX_BODY_BYTES)?;

        Ok(json!({
            "status": status,
            "headers": response_headers,
            "body": text,
        })
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HostApiConfig, net::AllowAllPolicy};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn ctx() -> PolicyContext {
        PolicyContext::new(&HostApiConfig::new("svc", "default"), None)
    }

    #[tokio::test]
    async fn fetches_and_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let cap = HttpCapability::new(reqwest::Client::new(), Box::new(AllowAllPolicy));
        let CapabilityOutcome::Value(v) = cap
            .call(
                "fetch",
                json!({"url": format!("{}/ping", server.uri())}),
                &ctx(),
            )
            .await
            .unwrap()
        else {
            panic!("expected value");
        };
        assert_eq!(v["status"], json!(200));
        assert_eq!(v["body"], json!("pong"));
    }

    #[tokio::test]
    async fn crlf_in_header_value_is_rejected() {
        let cap = HttpCapability::new(reqwest::Client::new(), Box::new(AllowAllPolicy));
        let err = cap
            .call(
                "fetch",
                json!({"url": "http://example.com", "headers": {"x-evil": "a\r\nb"}}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Policy(_)));
    }
}
