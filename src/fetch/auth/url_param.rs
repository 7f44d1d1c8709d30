use crate::fetch::client::HttpClient;
use anyhow::{Result, bail};
use async_trait::async_trait;

/// An [`HttpClient`] wrapper that appends an API key as a URL query parameter,
/// for AVL providers that take e.g. `?api_key=...` instead of a header.
pub struct UrlParam<C> {
    inner: C,
    param_name: String,
    key: String,
}

impl<C> UrlParam<C> {
    pub fn new(inner: C, param_name: &str, key: &str) -> Result<Self> {
        if param_name.trim().is_empty() {
            bail!("API key parameter name is empty");
        }
        Ok(Self {
            inner,
            param_name: param_name.trim().to_string(),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for UrlParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.url_mut()
            .query_pairs_mut()
            .append_pair(&self.param_name, &self.key);
        self.inner.execute(req).await
    }
}
