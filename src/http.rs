//! HTTP transport shared by the network-backed metadata services

use reqwest::{Client, Method, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::FirstbootError;

/// TLS settings for a metadata endpoint
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification
    pub https_allow_insecure: bool,
    /// Extra PEM bundle to trust
    pub https_ca_bundle: Option<PathBuf>,
}

/// A reqwest client bound to a metadata base URL
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Option<Url>,
}

impl HttpTransport {
    pub fn new(base_url: Option<&str>, tls: &TlsOptions) -> Result<Self, FirstbootError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(2));

        if tls.https_allow_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(bundle) = &tls.https_ca_bundle {
            builder = builder.add_root_certificate(load_certificate(bundle)?);
        }

        let base_url = base_url.map(parse_base_url).transpose()?;

        Ok(Self {
            client: builder.build()?,
            base_url,
        })
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn set_base_url(&mut self, base_url: &str) -> Result<(), FirstbootError> {
        self.base_url = Some(parse_base_url(base_url)?);
        Ok(())
    }

    /// Resolve `path` against the base URL. Absolute URLs are kept as is.
    pub fn resolve(&self, path: &str) -> Result<Url, FirstbootError> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| FirstbootError::Config("metadata base URL not set".to_string()))?;
        base.join(path)
            .map_err(|e| FirstbootError::InvalidData(format!("bad metadata path {path}: {e}")))
    }

    /// Perform a single request.
    ///
    /// Without an explicit method, a body means POST and no body means GET.
    /// A 404 response maps to [`FirstbootError::NotFound`].
    pub async fn request(
        &self,
        path: &str,
        body: Option<Vec<u8>>,
        headers: &[(String, String)],
        method: Option<Method>,
    ) -> Result<Vec<u8>, FirstbootError> {
        let url = self.resolve(path)?;
        let method = method.unwrap_or(if body.is_some() {
            Method::POST
        } else {
            Method::GET
        });
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FirstbootError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FirstbootError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, FirstbootError> {
        self.request(path, None, &[], None).await
    }

    pub async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, FirstbootError> {
        self.request(path, Some(body), &[], None).await
    }
}

/// Parse a base URL, making sure relative joins append to it
fn parse_base_url(base_url: &str) -> Result<Url, FirstbootError> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&normalized)
        .map_err(|e| FirstbootError::Config(format!("invalid base URL {base_url}: {e}")))
}

fn load_certificate(path: &Path) -> Result<reqwest::Certificate, FirstbootError> {
    let pem = std::fs::read(path)?;
    reqwest::Certificate::from_pem(&pem).map_err(FirstbootError::from)
}
