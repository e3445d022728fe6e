//! Minimal WebDriver client for script jobs
//!
//! Speaks enough of the W3C protocol (with JSON-wire fallbacks for the
//! session id) to open a session on a vendor hub, drive it from a script,
//! and close it.

use crate::config::Credentials;
use crossrun_common::{Error, Result};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const SESSION_TIMEOUT: Duration = Duration::from_secs(300);

struct Inner {
    http: reqwest::Client,
    hub: String,
    credentials: Option<Credentials>,
    id: String,
}

/// Handle to a live remote browser session. Clones share the session.
#[derive(Clone)]
pub struct WebDriverSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebDriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDriverSession")
            .field("hub", &self.inner.hub)
            .field("id", &self.inner.id)
            .finish()
    }
}

impl WebDriverSession {
    /// Open a new session on `hub` with the given desired capabilities
    pub async fn create(
        hub: &str,
        capabilities: Value,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(SESSION_TIMEOUT).build()?;
        let hub = hub.trim_end_matches('/').to_string();
        let body = json!({
            "desiredCapabilities": capabilities,
            "capabilities": { "alwaysMatch": capabilities },
        });

        let url = format!("{}/session", hub);
        let response = send(&http, credentials.as_ref(), Method::POST, &url, Some(&body)).await?;
        let id = response
            .get("sessionId")
            .or_else(|| response.get("value").and_then(|v| v.get("sessionId")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::VendorRejection {
                vendor: hub.clone(),
                message: format!("no session id in response: {}", response),
            })?;

        debug!("WebDriver session {} opened on {}", id, hub);
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                hub,
                credentials,
                id,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    async fn command(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}/session/{}{}", self.inner.hub, self.inner.id, path);
        let credentials = self.inner.credentials.as_ref();
        let response = send(&self.inner.http, credentials, method, &url, body).await?;
        Ok(response.get("value").cloned().unwrap_or(Value::Null))
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.command(Method::POST, "/url", Some(&json!({ "url": url })))
            .await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        let value = self.command(Method::GET, "/url", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal(format!("unexpected url value: {}", value)))
    }

    /// Run synchronous JavaScript in the page and return its result
    pub async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(&json!({ "script": script, "args": args })),
        )
        .await
    }

    /// Base64-encoded PNG of the current viewport
    pub async fn screenshot(&self) -> Result<String> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("screenshot returned no image".to_string()))
    }

    /// End the session. Quitting a session the hub already closed is fine.
    pub async fn quit(&self) -> Result<()> {
        match self.command(Method::DELETE, "", None).await {
            Ok(_) => {
                debug!("WebDriver session {} closed", self.inner.id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn send(
    http: &reqwest::Client,
    credentials: Option<&Credentials>,
    method: Method,
    url: &str,
    body: Option<&Value>,
) -> Result<Value> {
    trace!("WebDriver {} {}", method, url);
    let mut request = http.request(method, url);
    if let Some(creds) = credentials {
        request = request.basic_auth(&creds.username, Some(&creds.access_key));
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if status == StatusCode::NOT_FOUND {
        return Err(Error::not_found("webdriver session", url));
    }
    let value: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text)?
    };
    if !status.is_success() {
        let message = value
            .get("value")
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(text);
        return Err(Error::VendorRejection {
            vendor: "webdriver".to_string(),
            message: format!("{}: {}", status, message),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        routing::{delete, get, post},
        Json, Router,
    };

    async fn hub() -> String {
        let app = Router::new()
            .route(
                "/wd/hub/session",
                post(|Json(body): Json<Value>| async move {
                    assert!(body["capabilities"]["alwaysMatch"]["browserName"].is_string());
                    Json(json!({ "value": { "sessionId": "s-1", "capabilities": {} } }))
                }),
            )
            .route(
                "/wd/hub/session/:id/url",
                get(|| async { Json(json!({ "value": "http://localhost/app" })) })
                    .post(|| async { Json(json!({ "value": null })) }),
            )
            .route(
                "/wd/hub/session/:id/execute/sync",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({ "value": body["args"][0].as_i64().unwrap_or(0) + 1 }))
                }),
            )
            .route(
                "/wd/hub/session/:id",
                delete(|Path(id): Path<String>| async move {
                    assert_eq!(id, "s-1");
                    Json(json!({ "value": null }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/wd/hub", addr)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let hub = hub().await;
        let session = WebDriverSession::create(&hub, json!({ "browserName": "chrome" }), None)
            .await
            .unwrap();
        assert_eq!(session.id(), "s-1");

        session.navigate("http://localhost/app").await.unwrap();
        assert_eq!(session.current_url().await.unwrap(), "http://localhost/app");
        assert_eq!(session.execute("return arguments[0] + 1", vec![json!(41)]).await.unwrap(), json!(42));
        session.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_not_found() {
        let hub = hub().await;
        let session = WebDriverSession::create(&hub, json!({ "browserName": "chrome" }), None)
            .await
            .unwrap();
        // The mock has no screenshot route, so the hub answers 404.
        let err = session.screenshot().await.unwrap_err();
        assert!(err.is_not_found());
    }
}
