//! HTTP client for the AirCloud REST API

use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use crate::errors::{Error, Result};

/// User agent the vendor gateway expects; other values are rejected.
const USER_AGENT: &str = "okhttp/4.2.2";

/// Thin wrapper around reqwest carrying the vendor header set.
pub struct RestClient {
    client: Client,
    base_url: Url,
    host: String,
}

/// Raw response, kept as text so callers can decide how to treat each status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

impl RestClient {
    /// Create a client for `https://{host}:{port}`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::from_base_url(&format!("https://{}:{}", host, port))
    }

    /// Create a client from an explicit base URL (used by tests against
    /// plain-HTTP stub servers).
    pub fn from_base_url(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::ConnectionFailed(format!("invalid base URL {}: {}", base_url, e)))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| Error::ConnectionFailed(format!("base URL has no host: {}", base_url)))?
            .to_string();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(Error::from_transport)?;

        Ok(Self {
            client,
            base_url,
            host,
        })
    }

    /// Perform one request and return the raw response if its status is in
    /// `accept_statuses`; any other status is an `UnexpectedResponse`.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        additional_headers: &[(&str, &str)],
        body: Option<&B>,
        accept_statuses: &[u16],
    ) -> Result<HttpResponse> {
        let url = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .header(header::HOST, &self.host)
            .header(header::USER_AGENT, USER_AGENT);

        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in additional_headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(Error::from_transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(Error::from_transport)?;
        debug!("Response status={} body={}", status, body);

        if !accept_statuses.contains(&status) {
            return Err(Error::UnexpectedResponse { status, body });
        }

        Ok(HttpResponse { status, body })
    }
}
