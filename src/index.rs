use std::sync::LazyLock;

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};
use url::Url;

use crate::fetch::Fetcher;

const ARTICLE_PREFIX: &str = "/wiki/";

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.wikitable").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "table.wikitable > tbody > tr, table.wikitable > thead > tr, table.wikitable > tr",
    )
    .unwrap()
});
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// One municipality entry from the index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MunicipalityLink {
    pub name: String,
    pub url: String,
}

/// Fetch the index page and return every municipality link in document order.
pub async fn fetch_municipality_links(
    fetcher: &dyn Fetcher,
    index_url: &str,
) -> Result<Vec<MunicipalityLink>> {
    let base = Url::parse(index_url).context("Invalid index URL")?;
    info!("Fetching municipality index: {}", index_url);
    let html = fetcher
        .text(index_url)
        .await
        .context("Failed to fetch municipality index")?;

    let links = parse_index(&html, &base);
    info!("Municipalities in index: {}", links.len());
    Ok(links)
}

/// Parse the index markup. A page without the expected table yields no links.
pub fn parse_index(html: &str, base: &Url) -> Vec<MunicipalityLink> {
    let doc = Html::parse_document(html);
    if doc.select(&TABLE).next().is_none() {
        warn!("No municipality table found on index page");
        return Vec::new();
    }
    links(&doc, base).collect()
}

/// Lazily walk the table rows, yielding rows whose first cell links to an article.
/// Each row is visited once, also when one wikitable sits inside another.
pub fn links<'a>(doc: &'a Html, base: &'a Url) -> impl Iterator<Item = MunicipalityLink> + 'a {
    doc.select(&ROW).filter_map(move |row| row_link(row, base))
}

fn row_link(row: ElementRef<'_>, base: &Url) -> Option<MunicipalityLink> {
    let cell = row.select(&CELL).next()?;
    let anchor = cell.select(&ANCHOR).next()?;
    let href = anchor.value().attr("href")?;
    if !is_article_href(href) {
        return None;
    }
    let name = anchor.text().collect::<String>().trim().to_string();
    let url = base.join(href).ok()?.to_string();
    Some(MunicipalityLink { name, url })
}

/// `/wiki/Aarau` is an article; `/wiki/Datei:Wappen.svg` lives in a namespace.
pub fn is_article_href(href: &str) -> bool {
    href.starts_with(ARTICLE_PREFIX) && !href.contains(':')
}
