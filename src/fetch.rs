use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

const USER_AGENT: &str = "gemeinde_crawler/0.1 (Swiss municipality dataset builder)";

/// Raw body plus the declared content type, for binary assets.
#[derive(Debug, Clone, Default)]
pub struct Asset {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

/// HTTP GET seam. Non-2xx responses are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn text(&self, url: &str) -> Result<String>;

    async fn asset(&self, url: &str) -> Result<Asset>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn text(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn asset(&self, url: &str) -> Result<Asset> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let data = resp.bytes().await?.to_vec();
        Ok(Asset { data, content_type })
    }
}
