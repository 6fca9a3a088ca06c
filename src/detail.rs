use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::fetch::Fetcher;
use crate::gemini::{GenerateRequest, GenerativeModel, TextAnswer};
use crate::index::MunicipalityLink;
use crate::resolver::resolve_original;
use crate::store::MunicipalityRecord;
use crate::stylize::{path_string, StyleRequest, Stylizer};

const MAX_PARAGRAPHS: usize = 5;
const MIN_PARAGRAPH_CHARS: usize = 50;

static INFOBOX: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".infobox").unwrap());
static PARAGRAPH: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#mw-content-text p").unwrap());
static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").unwrap());

/// The parts of an article page that go into the extraction prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticlePage {
    pub infobox_html: String,
    pub article_content: String,
}

/// Facts as answered by the text model.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFacts {
    #[serde(default)]
    pub bfs_id: Option<Value>,
    #[serde(default)]
    pub image_page_url: Option<String>,
    #[serde(default)]
    pub flag_page_url: Option<String>,
    #[serde(default)]
    pub geography: Option<String>,
    #[serde(default)]
    pub appearance: Option<String>,
    #[serde(default)]
    pub points_of_interest: Option<Vec<String>>,
}

impl ExtractedFacts {
    /// The model answers with either a string or a number.
    pub fn bfs_id(&self) -> String {
        match &self.bfs_id {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

pub struct DetailExtractor {
    fetcher: Arc<dyn Fetcher>,
    model: Arc<dyn GenerativeModel>,
    stylizer: Option<Stylizer>,
    text_model: String,
    extract_flags: bool,
}

impl DetailExtractor {
    pub fn new(config: &Config, fetcher: Arc<dyn Fetcher>, model: Arc<dyn GenerativeModel>) -> Self {
        let stylizer = config
            .stylize
            .then(|| Stylizer::new(config, model.clone(), fetcher.clone()));
        Self {
            fetcher,
            model,
            stylizer,
            text_model: config.text_model.clone(),
            extract_flags: config.extract_flags,
        }
    }

    /// Run the full per-municipality pipeline. Failures are logged and yield `None`.
    pub async fn extract(&self, link: &MunicipalityLink) -> Option<MunicipalityRecord> {
        match self.try_extract(link).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping {}: {:#}", link.name, e);
                None
            }
        }
    }

    async fn try_extract(&self, link: &MunicipalityLink) -> Result<MunicipalityRecord> {
        let name = link.name.as_str();
        let base = Url::parse(&link.url).context("invalid page URL")?;
        let html = self.fetcher.text(&link.url).await?;
        let page = parse_article(&html).ok_or_else(|| anyhow!("no infobox on page"))?;

        let prompt = build_prompt(name, &page, self.extract_flags);
        let response = self
            .model
            .generate(&self.text_model, &GenerateRequest::text(prompt))
            .await?;
        let answer = match response.text_answer() {
            TextAnswer::Text(text) => text,
            TextAnswer::NoCandidate => bail!("model returned no candidate"),
            TextAnswer::NoContent => bail!("model candidate has no content"),
            TextAnswer::NoText => bail!("model answer has no text part"),
        };
        let facts = parse_facts(&answer)?;
        debug!("{}: model answered {:?}", name, facts);

        let image_url = self
            .resolve(name, "photo", facts.image_page_url.as_deref(), &base)
            .await;
        let flag_url = if self.extract_flags {
            self.resolve(name, "flag", facts.flag_page_url.as_deref(), &base)
                .await
        } else {
            None
        };

        let mut record = MunicipalityRecord {
            name: name.to_string(),
            bfs_id: facts.bfs_id(),
            source_url: link.url.clone(),
            image_url,
            flag_url,
            stylized_image_path: None,
            geography: non_empty(facts.geography),
            appearance: non_empty(facts.appearance),
            points_of_interest: facts.points_of_interest,
        };

        if let Some(stylizer) = &self.stylizer {
            // Reference images only in the flag-aware pipeline.
            let with_refs = self.extract_flags;
            let req = StyleRequest {
                name,
                geography: record.geography.as_deref(),
                points_of_interest: record.points_of_interest.as_deref().unwrap_or(&[]),
                photo_url: record.image_url.as_deref().filter(|_| with_refs),
                flag_url: record.flag_url.as_deref(),
            };
            let stylized = stylizer.stylize(&req).await;
            record.stylized_image_path = stylized.as_deref().map(path_string);
        }

        Ok(record)
    }

    async fn resolve(&self, name: &str, label: &str, page_url: Option<&str>, base: &Url) -> Option<String> {
        let page_url = page_url.map(str::trim).filter(|u| !u.is_empty())?;
        let resolved = resolve_original(self.fetcher.as_ref(), page_url, base).await;
        if resolved.is_none() {
            warn!("{}: no {} for {}", name, label, page_url);
        }
        resolved
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Infobox markup plus the leading substantial paragraphs. `None` without an infobox.
pub fn parse_article(html: &str) -> Option<ArticlePage> {
    let doc = Html::parse_document(html);
    let infobox_html = doc.select(&INFOBOX).next()?.inner_html();

    let article_content = doc
        .select(&PARAGRAPH)
        .map(|p| p.text().collect::<String>().trim().to_string())
        .filter(|t| t.chars().count() > MIN_PARAGRAPH_CHARS)
        .take(MAX_PARAGRAPHS)
        .collect::<Vec<_>>()
        .join("\n\n");

    Some(ArticlePage {
        infobox_html,
        article_content,
    })
}

/// Pull the first `{...}` span out of the model's answer and parse it.
pub fn parse_facts(answer: &str) -> Result<ExtractedFacts> {
    let json = JSON_OBJECT
        .find(answer)
        .ok_or_else(|| anyhow!("no JSON object in model answer"))?;
    serde_json::from_str(json.as_str()).context("model answer is not valid JSON")
}

pub fn build_prompt(name: &str, page: &ArticlePage, extract_flags: bool) -> String {
    let flag_field = if extract_flags {
        "\n- \"flagPageUrl\": the link target (href) of the coat of arms image in the infobox, or null."
    } else {
        ""
    };
    let flag_rules = if extract_flags {
        "\n\nRules for flagPageUrl:\n\
         - Choose the image whose caption or filename contains \"Wappen\", \"Blason\", \"Stemma\" or \"coat\".\n\
         - Return the href exactly as it appears in the infobox."
    } else {
        ""
    };

    format!(
        r#"You are extracting structured data about the Swiss municipality "{name}" from its Wikipedia article.

Infobox HTML:
{infobox}

Article text:
{article}

Return a single JSON object with these fields:
- "bfsId": the official BFS municipality number (BFS-Nr.) as a string, or "" if it is not given.
- "imagePageUrl": the link target (href) of the best photograph of the municipality in the infobox, usually a file description page such as /wiki/Datei:..., or null.{flag_field}
- "geography": the location, terrain and landscape of the municipality in at most 100 words, or null.
- "appearance": the townscape and typical architecture in at most 100 words, or null.
- "pointsOfInterest": an array with the names of notable landmarks and sights, or null.

Rules for imagePageUrl:
- Prefer images whose caption or filename indicates a photograph, such as "Ansicht", "Luftbild", "Panorama" or "Blick".
- Never choose a coat of arms. Reject images whose caption or filename contains "Wappen", "Blason", "Stemma" or "coat".
- Ignore maps and locator images ("Karte", "Lage").
- Return the href exactly as it appears in the infobox.{flag_rules}

Respond with the JSON object only."#,
        name = name,
        infobox = page.infobox_html.trim(),
        article = page.article_content,
        flag_field = flag_field,
        flag_rules = flag_rules,
    )
}
