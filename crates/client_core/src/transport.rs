use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use shared::error::ApiError;
use url::Url;

use crate::config::ClientSettings;

/// Remote service a [`ServiceRequest`] is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Activity,
    Kms,
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// A JSON request relative to a service base url.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub service: Service,
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl ServiceRequest {
    pub fn new(service: Service, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            service,
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Get, path)
    }

    pub fn post(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Post, path)
    }

    pub fn put(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Put, path)
    }

    pub fn delete(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Delete, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body).context("failed to encode request body")?);
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ServiceRequest) -> Result<Value>;
    /// Posts a raw body to an absolute url. Used for the KMS message endpoint.
    async fn send_raw(&self, url: &str, body: String, headers: Vec<(String, String)>)
        -> Result<String>;
    async fn upload(&self, url: &str, bytes: Vec<u8>, content_type: &str) -> Result<Value>;
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn access_token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(anyhow!("no access token configured"));
        }
        Ok(self.token.clone())
    }
}

/// reqwest-backed [`Transport`] sending a bearer token with every request.
pub struct HttpTransport {
    http: Client,
    settings: ClientSettings,
    authenticator: Arc<dyn Authenticator>,
}

impl HttpTransport {
    pub fn new(settings: ClientSettings, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            http: Client::new(),
            settings,
            authenticator,
        }
    }

    fn base_url(&self, service: Service) -> &str {
        match service {
            Service::Activity => &self.settings.activity_service_url,
            Service::Kms => &self.settings.kms_service_url,
            Service::Flag => &self.settings.flag_service_url,
        }
    }

    fn resolve(&self, request: &ServiceRequest) -> Result<Url> {
        let base = self.base_url(request.service).trim_end_matches('/');
        let path = request.path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{base}/{path}"))
            .with_context(|| format!("invalid url for {:?} {}", request.service, request.path))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ServiceRequest) -> Result<Value> {
        let url = self.resolve(&request)?;
        let token = self.authenticator.access_token().await?;
        let mut builder = self
            .http
            .request(request.method.into(), url.clone())
            .bearer_auth(token);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            bail!(
                "{} {url} failed with {status}: {}",
                request.method.as_str(),
                describe_error(&text)
            );
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid json from {url}"))
    }

    async fn send_raw(
        &self,
        url: &str,
        body: String,
        headers: Vec<(String, String)>,
    ) -> Result<String> {
        let token = self.authenticator.access_token().await?;
        let mut builder = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            bail!("POST {url} failed with {status}: {}", describe_error(&text));
        }
        Ok(text)
    }

    async fn upload(&self, url: &str, bytes: Vec<u8>, content_type: &str) -> Result<Value> {
        let token = self.authenticator.access_token().await?;
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            bail!("upload to {url} failed with {status}: {}", describe_error(&text));
        }
        serde_json::from_str(&text).with_context(|| format!("invalid upload response from {url}"))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let token = self.authenticator.access_token().await?;
        let bytes = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

fn describe_error(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(api_error) => api_error.description().to_string(),
        Err(_) if body.is_empty() => "empty response body".to_string(),
        Err(_) => body.to_string(),
    }
}
