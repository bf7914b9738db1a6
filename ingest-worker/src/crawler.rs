//! Single-page HTTP crawler.
//!
//! Each queued job names one page URL, so the default crawler fetches that
//! page, extracts its text by MIME type, and emits exactly one [`Page`].
//! Site walking and sitemap expansion belong to the external crawler
//! service, which enqueues one descriptor per discovered URL; swapping that
//! service in means implementing [`Crawler`] over its client.

use async_trait::async_trait;
use ingest_core::extract::TextExtractor;
use ingest_core::runner::Crawler;
use ingest_core::{Error, Page, Result, Website};
use tokio::sync::mpsc;
use tracing::debug;

/// Fetches one page per job over HTTP.
pub struct HttpPageCrawler {
    client: reqwest::Client,
    extractor: TextExtractor,
}

impl HttpPageCrawler {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("ingest-worker/0.3")
            .build()
            .unwrap_or_default();
        Self {
            client,
            extractor: TextExtractor::new(),
        }
    }
}

impl Default for HttpPageCrawler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Crawler for HttpPageCrawler {
    async fn crawl(
        &self,
        _website: &Website,
        start_url: &str,
        pages: mpsc::Sender<Page>,
    ) -> Result<()> {
        let response = self
            .client
            .get(start_url)
            .send()
            .await
            .map_err(|e| Error::Crawl(format!("fetch failed for {start_url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Crawl(format!("{start_url} returned {status}")));
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Crawl(format!("read failed for {start_url}: {e}")))?;

        let content = self.extractor.extract(&mime, &body)?;
        debug!(url = start_url, bytes = body.len(), chars = content.len(), "fetched page");

        let _ = pages
            .send(Page {
                url: start_url.to_string(),
                content,
            })
            .await;
        Ok(())
    }
}
