//! HTTP transport with browser-shaped defaults and per-proxy clients.
//!
//! The upstream's bot detection keys off handshake shape as much as header
//! content, so the client is built once per egress (TLS/connection reuse
//! keeps the handshake stable per proxy) with browser-like defaults, and
//! only rebuilt when the active proxy changes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder};
use serde_json::Value;

use crate::error::QueryError;

/// Status plus decoded JSON body. Non-JSON bodies decode to `Null` so the
/// caller's envelope checks fail closed instead of erroring out.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

/// Seam between the dispatcher/negotiator and the wire, so tests can
/// script replies without a network.
#[async_trait]
pub trait QueryTransport: Send {
    /// POSTs a JSON body through the given proxy URI (None = direct).
    async fn post_json(
        &mut self,
        url: &str,
        headers: HeaderMap,
        body: &Value,
        proxy: Option<&str>,
    ) -> Result<Reply, QueryError>;

    /// POSTs a form-encoded body, always direct (token endpoint only).
    async fn post_form(
        &mut self,
        url: &str,
        headers: HeaderMap,
        form: &[(&str, String)],
    ) -> Result<Reply, QueryError>;
}

pub struct HttpTransport {
    timeout: Duration,
    direct: Client,
    /// Client bound to the proxy address it was built for.
    proxied: Option<(String, Client)>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, QueryError> {
        Ok(Self {
            timeout,
            direct: build_client(timeout, None)?,
            proxied: None,
        })
    }

    fn client_for(&mut self, proxy: Option<&str>) -> Result<&Client, QueryError> {
        match proxy {
            None => Ok(&self.direct),
            Some(address) => {
                let stale = match &self.proxied {
                    Some((current, _)) => current != address,
                    None => true,
                };
                if stale {
                    let client = build_client(self.timeout, Some(address))?;
                    self.proxied = Some((address.to_string(), client));
                }
                Ok(&self.proxied.as_ref().unwrap().1)
            }
        }
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, QueryError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert("Accept-Language", HeaderValue::from_static("zh-CN,zh;q=0.9"));
    default_headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let mut builder = ClientBuilder::new()
        .timeout(timeout)
        .cookie_store(true)
        .gzip(true)
        .brotli(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .default_headers(default_headers);

    if let Some(address) = proxy {
        let proxy = reqwest::Proxy::all(address)
            .map_err(|e| QueryError::Network(format!("bad proxy {}: {}", address, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| QueryError::Network(format!("client build failed: {}", e)))
}

async fn decode(resp: reqwest::Response) -> Result<Reply, QueryError> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;
    let body = serde_json::from_str(&text).unwrap_or(Value::Null);
    Ok(Reply { status, body })
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn post_json(
        &mut self,
        url: &str,
        headers: HeaderMap,
        body: &Value,
        proxy: Option<&str>,
    ) -> Result<Reply, QueryError> {
        let client = self.client_for(proxy)?;
        let resp = client.post(url).headers(headers).json(body).send().await?;
        decode(resp).await
    }

    async fn post_form(
        &mut self,
        url: &str,
        headers: HeaderMap,
        form: &[(&str, String)],
    ) -> Result<Reply, QueryError> {
        let resp = self
            .direct
            .post(url)
            .headers(headers)
            .form(form)
            .send()
            .await?;
        decode(resp).await
    }
}
