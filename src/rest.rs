//! Thin HTTP layer shared by all catalog targets.
//!
//! Targets talk to their servers through the [`RestTransport`] trait so
//! that the REST flows can be exercised in tests with a scripted transport.
//! The production implementation wraps a [`reqwest::Client`] with basic
//! auth credentials resolved at construction time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing request. Bodies are raw bytes; the content type decides how
/// the server interprets them (JSON body, XML document, zipped bundle, ...).
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

impl RestRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            content_type: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Vec<u8>,
    url: String,
}

impl RestResponse {
    pub fn new(status: u16, body: Vec<u8>, url: impl Into<String>) -> Self {
        Self {
            status,
            body,
            url: url.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }

    pub fn value(&self) -> TransportResult<serde_json::Value> {
        self.json()
    }
}

/// Transport seam. Implementations must turn non-2xx statuses into
/// [`TransportError::Status`] so callers can match on the code.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn send(&self, request: RestRequest) -> TransportResult<RestResponse>;
}

/// Production transport backed by reqwest with optional basic auth.
pub struct ReqwestTransport {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }
}

#[async_trait]
impl RestTransport for ReqwestTransport {
    async fn send(&self, request: RestRequest) -> TransportResult<RestResponse> {
        let method = request.method;
        let url = request.url.clone();
        debug!("{} {}", method, url);

        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| TransportError::Connection {
            method: method.to_string(),
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Decode {
                url: url.clone(),
                reason: e.to_string(),
            })?
            .to_vec();

        if !(200..300).contains(&status) {
            return Err(TransportError::Status {
                method: method.to_string(),
                url,
                status,
            });
        }
        Ok(RestResponse::new(status, body, request.url))
    }
}

/// Convenience wrapper bundling the transport with typed helpers.
#[derive(Clone)]
pub struct RestClient {
    transport: Arc<dyn RestTransport>,
}

impl RestClient {
    pub fn new(transport: Arc<dyn RestTransport>) -> Self {
        Self { transport }
    }

    pub async fn send(&self, request: RestRequest) -> TransportResult<RestResponse> {
        self.transport.send(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> TransportResult<T> {
        let response = self.send(RestRequest::new(Method::Get, url)).await?;
        response.json()
    }

    pub async fn get_value(&self, url: &str) -> TransportResult<serde_json::Value> {
        self.get_json(url).await
    }

    pub async fn get_text(&self, url: &str) -> TransportResult<String> {
        let response = self.send(RestRequest::new(Method::Get, url)).await?;
        Ok(response.text())
    }

    pub async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> TransportResult<RestResponse> {
        let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.send(RestRequest::new(Method::Post, url).with_body(bytes, "application/json"))
            .await
    }

    pub async fn put_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> TransportResult<RestResponse> {
        let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.send(RestRequest::new(Method::Put, url).with_body(bytes, "application/json"))
            .await
    }

    pub async fn post_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> TransportResult<RestResponse> {
        self.send(RestRequest::new(Method::Post, url).with_body(body, content_type))
            .await
    }

    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> TransportResult<RestResponse> {
        self.send(RestRequest::new(Method::Put, url).with_body(body, content_type))
            .await
    }

    pub async fn put_text(
        &self,
        url: &str,
        body: &str,
        content_type: &str,
    ) -> TransportResult<RestResponse> {
        self.send(
            RestRequest::new(Method::Put, url).with_body(body.as_bytes().to_vec(), content_type),
        )
        .await
    }

    pub async fn delete(&self, url: &str) -> TransportResult<RestResponse> {
        self.send(RestRequest::new(Method::Delete, url)).await
    }

    /// Idempotent delete: a 404 means the resource is already absent and is
    /// not an error. Returns true when the delete actually removed
    /// something.
    pub async fn delete_absent_ok(&self, url: &str) -> TransportResult<bool> {
        match self.delete(url).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
