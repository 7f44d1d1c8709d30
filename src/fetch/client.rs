use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::{Method, Request, Response};

/// Seam between feed sources and the network, so credentials and test
/// doubles can wrap the transport without the sources knowing.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

/// Fetches `url` and returns the response body, failing on non-success
/// status codes.
#[tracing::instrument(skip(client))]
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = Request::new(Method::GET, url.parse()?);

    let resp = client.execute(req).await?;
    if !resp.status().is_success() {
        bail!("GET {url} returned {}", resp.status());
    }
    Ok(resp.bytes().await?.to_vec())
}
