use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::fetch::Fetcher;

static ORIGINAL_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".fullMedia a[href]").unwrap());

/// Resolve a file description page to the absolute URL of its original media file.
/// `base` anchors relative page links (usually the article the link came from).
pub async fn resolve_original(fetcher: &dyn Fetcher, page_url: &str, base: &Url) -> Option<String> {
    match try_resolve(fetcher, page_url, base).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Could not resolve media file {}: {:#}", page_url, e);
            None
        }
    }
}

async fn try_resolve(fetcher: &dyn Fetcher, page_url: &str, base: &Url) -> Result<String> {
    let page = base
        .join(page_url)
        .with_context(|| format!("Invalid file page URL {}", page_url))?;
    let html = fetcher.text(page.as_str()).await?;
    original_link(&html, &page).ok_or_else(|| anyhow!("no original file link on page"))
}

/// Protocol-relative and root-relative hrefs are made absolute against `page`.
pub fn original_link(html: &str, page: &Url) -> Option<String> {
    let doc = Html::parse_document(html);
    let href = doc.select(&ORIGINAL_LINK).next()?.value().attr("href")?;
    page.join(href).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeFetcher;

    fn article() -> Url {
        Url::parse("https://de.wikipedia.org/wiki/Aarau").unwrap()
    }

    #[test]
    fn protocol_relative_link() {
        let html = std::fs::read_to_string("tests/fixtures/file_page.html").unwrap();
        assert_eq!(
            original_link(&html, &article()).as_deref(),
            Some("https://upload.wikimedia.org/wikipedia/commons/a/ab/Aarau_Altstadt.jpg")
        );
    }

    #[test]
    fn root_relative_link() {
        let html = r#"<div class="fullMedia"><p><a href="/media/Aarau.jpg" class="internal">Original</a></p></div>"#;
        assert_eq!(
            original_link(html, &article()).as_deref(),
            Some("https://de.wikipedia.org/media/Aarau.jpg")
        );
    }

    #[test]
    fn missing_media_block() {
        assert!(original_link("<p>nothing here</p>", &article()).is_none());
    }

    #[tokio::test]
    async fn relative_page_url_is_fetched_absolute() {
        let html = std::fs::read_to_string("tests/fixtures/file_page.html").unwrap();
        let fetcher = FakeFetcher::default()
            .page("https://de.wikipedia.org/wiki/Datei:Aarau_Altstadt.jpg", &html);
        let url = resolve_original(&fetcher, "/wiki/Datei:Aarau_Altstadt.jpg", &article()).await;
        assert_eq!(
            url.as_deref(),
            Some("https://upload.wikimedia.org/wikipedia/commons/a/ab/Aarau_Altstadt.jpg")
        );
    }

    #[tokio::test]
    async fn fetch_failure_is_none() {
        let fetcher = FakeFetcher::default();
        assert!(resolve_original(&fetcher, "/wiki/Datei:Missing.jpg", &article())
            .await
            .is_none());
    }
}
