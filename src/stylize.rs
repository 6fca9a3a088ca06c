use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use resvg::{tiny_skia, usvg};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fetch::{Asset, Fetcher};
use crate::gemini::{GenerateRequest, GenerateResponse, GenerativeModel, InlineData};

/// Substrings marking a server-side failure worth another attempt.
const TRANSIENT_MARKERS: [&str; 3] = ["500", "INTERNAL", "RESOURCE_EXHAUSTED"];
const BASE_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const FLAG_CANVAS: u32 = 512;
const DEFAULT_GEOGRAPHY: &str = "gentle green hills and meadows typical of the Swiss countryside";
const DEFAULT_LANDMARKS: &str =
    "The island features a cosy village centre with traditional Swiss houses and a small church.";

/// Facts the image prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct StyleRequest<'a> {
    pub name: &'a str,
    pub geography: Option<&'a str>,
    pub points_of_interest: &'a [String],
    pub photo_url: Option<&'a str>,
    pub flag_url: Option<&'a str>,
}

pub struct Stylizer {
    model: Arc<dyn GenerativeModel>,
    fetcher: Arc<dyn Fetcher>,
    image_model: String,
    images_dir: PathBuf,
    max_attempts: u32,
}

impl Stylizer {
    pub fn new(config: &Config, model: Arc<dyn GenerativeModel>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            model,
            fetcher,
            image_model: config.image_model.clone(),
            images_dir: config.images_dir.clone(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Generate (or reuse) the stylized rendering and return its path.
    pub async fn stylize(&self, req: &StyleRequest<'_>) -> Option<PathBuf> {
        if let Some(existing) = self.existing(req.name).await {
            debug!("Reusing stylized image for {}: {}", req.name, existing.display());
            return Some(existing);
        }

        let photo = self.reference(req.name, "photo", req.photo_url).await;
        let flag = self.reference(req.name, "flag", req.flag_url).await;
        let prompt = build_prompt(
            req.name,
            req.geography,
            req.points_of_interest,
            photo.is_some(),
            flag.is_some(),
        );
        let attachments: Vec<InlineData> = photo.into_iter().chain(flag).collect();
        let request = GenerateRequest::image(prompt, attachments);

        let response = self.generate_with_retry(req.name, &request).await?;
        let Some(image) = response.inline_image() else {
            warn!("No image returned for {}", req.name);
            return None;
        };

        match self.write_image(req.name, image).await {
            Ok(path) => {
                info!("Stylized image for {} saved to {}", req.name, path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to save stylized image for {}: {:#}", req.name, e);
                None
            }
        }
    }

    async fn existing(&self, name: &str) -> Option<PathBuf> {
        for ext in ["png", "jpg"] {
            let path = self.image_path(name, ext);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    fn image_path(&self, name: &str, ext: &str) -> PathBuf {
        self.images_dir
            .join(format!("{}_stylized.{}", sanitize_name(name), ext))
    }

    async fn generate_with_retry(&self, name: &str, request: &GenerateRequest) -> Option<GenerateResponse> {
        for attempt in 0..self.max_attempts {
            let err = match self.model.generate(&self.image_model, request).await {
                Ok(response) => return Some(response),
                Err(e) => format!("{:#}", e),
            };

            if !is_transient(&err) {
                warn!("Image generation failed for {}: {}", name, err);
                return None;
            }
            if attempt + 1 == self.max_attempts {
                warn!(
                    "Image generation for {} still failing after {} attempts: {}",
                    name, self.max_attempts, err
                );
                return None;
            }

            let wait = backoff(attempt);
            warn!(
                "Transient image generation error for {} (attempt {}/{}), backing off {}s",
                name,
                attempt + 1,
                self.max_attempts,
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
        }
        None
    }

    /// Fetch one reference image. Any failure drops the reference, never the call.
    async fn reference(&self, name: &str, label: &str, url: Option<&str>) -> Option<InlineData> {
        let url = url?;
        let asset = match self.fetcher.asset(url).await {
            Ok(asset) if !asset.data.is_empty() => asset,
            Ok(_) => {
                warn!("Empty {} reference for {}, skipping", label, name);
                return None;
            }
            Err(e) => {
                warn!("Could not fetch {} reference for {}: {:#}", label, name, e);
                return None;
            }
        };

        let mime = mime_type(&asset, url);
        let (mime, data) = if mime == "image/svg+xml" {
            match rasterize_svg(&asset.data) {
                Ok(png) => ("image/png".to_string(), png),
                Err(e) => {
                    warn!("Could not rasterize {} for {}: {:#}", label, name, e);
                    return None;
                }
            }
        } else {
            (mime, asset.data)
        };

        Some(InlineData {
            mime_type: mime,
            data: STANDARD.encode(data),
        })
    }

    async fn write_image(&self, name: &str, image: &InlineData) -> Result<PathBuf> {
        let bytes = STANDARD.decode(image.data.as_bytes())?;
        let ext = if image.mime_type.contains("jpeg") { "jpg" } else { "png" };
        tokio::fs::create_dir_all(&self.images_dir).await?;
        let path = self.image_path(name, ext);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// ASCII letters and digits survive; everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Wait after the 0-based `attempt` failed: 2s, 4s, 8s, ... capped at one minute.
fn backoff(attempt: u32) -> Duration {
    let secs = BASE_BACKOFF_SECS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

pub fn is_transient(message: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}

pub fn build_prompt(
    name: &str,
    geography: Option<&str>,
    points_of_interest: &[String],
    has_photo: bool,
    has_flag: bool,
) -> String {
    let geography = geography
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or(DEFAULT_GEOGRAPHY);

    let mut prompt = format!(
        "Create a stylized 3D isometric diorama of the Swiss municipality of {}, \
         shaped as a miniature floating island with soft lighting and vibrant colors. \
         The terrain shows {}. {}",
        name,
        geography,
        landmark_clause(points_of_interest)
    );
    if has_photo {
        prompt.push_str(
            " Use the attached reference photo as a guide for the architecture and the layout of the town.",
        );
    }
    if has_flag {
        prompt.push_str(
            " Place the coat of arms from the attached flag image on a small flagpole at the edge of the island.",
        );
    }
    prompt.push_str(" Do not add any text or labels.");
    prompt
}

fn landmark_clause(points_of_interest: &[String]) -> String {
    match points_of_interest {
        [] => DEFAULT_LANDMARKS.to_string(),
        [only] => format!("The island features {}.", only),
        [first, second] => format!("The island features {} and {}.", first, second),
        [init @ .., last] => format!("The island features {}, and {}.", init.join(", "), last),
    }
}

fn mime_type(asset: &Asset, url: &str) -> String {
    if let Some(ct) = &asset.content_type {
        let ct = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if ct.starts_with("image/") {
            return ct;
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
    .to_string()
}

/// Fit an SVG into a transparent square canvas and encode it as PNG.
pub fn rasterize_svg(data: &[u8]) -> Result<Vec<u8>> {
    let tree = usvg::Tree::from_data(data, &usvg::Options::default())?;
    let size = tree.size();
    let mut pixmap = tiny_skia::Pixmap::new(FLAG_CANVAS, FLAG_CANVAS)
        .ok_or_else(|| anyhow!("could not allocate {0}x{0} canvas", FLAG_CANVAS))?;

    let canvas = FLAG_CANVAS as f32;
    let scale = (canvas / size.width()).min(canvas / size.height());
    let dx = (canvas - size.width() * scale) / 2.0;
    let dy = (canvas - size.height() * scale) / 2.0;
    let transform = tiny_skia::Transform::from_row(scale, 0.0, 0.0, scale, dx, dy);
    resvg::render(&tree, transform, &mut pixmap.as_mut());

    Ok(pixmap.encode_png()?)
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{image_response, FakeFetcher, FakeModel};
    use tokio::time::Instant;

    const PNG_B64: &str = "iVBORw0KGgo=";

    fn stylizer(dir: &Path, model: Arc<FakeModel>, fetcher: FakeFetcher) -> Stylizer {
        let config = Config {
            images_dir: dir.to_path_buf(),
            ..Default::default()
        };
        Stylizer::new(&config, model, Arc::new(fetcher))
    }

    fn pois(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sanitize_replaces_non_ascii_alphanumerics() {
        assert_eq!(sanitize_name("Zürich"), "Z_rich");
        assert_eq!(sanitize_name("Biel/Bienne"), "Biel_Bienne");
        assert_eq!(sanitize_name("Rüti bei Büren"), "R_ti_bei_B_ren");
        assert_eq!(sanitize_name("Aarau"), "Aarau");
    }

    #[test]
    fn landmark_grammar() {
        assert!(build_prompt("X", None, &[], false, false).contains(DEFAULT_LANDMARKS));
        assert!(build_prompt("X", None, &pois(&["Oberturm"]), false, false)
            .contains("The island features Oberturm."));
        assert!(build_prompt("X", None, &pois(&["Oberturm", "Stadtkirche"]), false, false)
            .contains("The island features Oberturm and Stadtkirche."));
        assert!(build_prompt("X", None, &pois(&["Oberturm", "Stadtkirche", "Kettenbrücke"]), false, false)
            .contains("The island features Oberturm, Stadtkirche, and Kettenbrücke."));
    }

    #[test]
    fn prompt_framing_and_references() {
        let p = build_prompt("Aarau", Some("the Aare valley"), &[], true, true);
        assert!(p.contains("stylized 3D isometric diorama"));
        assert!(p.contains("miniature floating island"));
        assert!(p.contains("The terrain shows the Aare valley."));
        assert!(p.contains("attached reference photo"));
        assert!(p.contains("attached flag image"));

        let bare = build_prompt("Aarau", None, &[], false, false);
        assert!(bare.contains(DEFAULT_GEOGRAPHY));
        assert!(!bare.contains("attached"));
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient("status 429: {\"status\": \"RESOURCE_EXHAUSTED\"}"));
        assert!(is_transient("request failed with status 500"));
        assert!(is_transient("INTERNAL error"));
        assert!(!is_transient("status 400: INVALID_ARGUMENT"));
    }

    #[test]
    fn svg_is_rasterized_to_square_canvas() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="100"><rect width="200" height="100" fill="red"/></svg>"#;
        let png = rasterize_svg(svg).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        // IHDR width/height, big-endian
        assert_eq!(u32::from_be_bytes(png[16..20].try_into().unwrap()), 512);
        assert_eq!(u32::from_be_bytes(png[20..24].try_into().unwrap()), 512);
    }

    #[test]
    fn mime_from_header_then_extension() {
        let with_header = Asset {
            data: vec![1],
            content_type: Some("image/png; charset=binary".into()),
        };
        assert_eq!(mime_type(&with_header, "https://x/a.jpg"), "image/png");
        let bare = Asset {
            data: vec![1],
            content_type: Some("application/octet-stream".into()),
        };
        assert_eq!(mime_type(&bare, "https://x/Wappen.SVG"), "image/svg+xml");
        assert_eq!(mime_type(&bare, "https://x/photo"), "image/jpeg");
    }

    #[tokio::test]
    async fn existing_image_skips_generation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Z_rich_stylized.jpg"), b"jpg").unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| Ok(image_response("image/png", PNG_B64))));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());

        let req = StyleRequest {
            name: "Zürich",
            ..Default::default()
        };
        let first = s.stylize(&req).await.unwrap();
        let second = s.stylize(&req).await.unwrap();

        assert_eq!(first, dir.path().join("Z_rich_stylized.jpg"));
        assert_eq!(first, second);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn second_run_reuses_generated_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| Ok(image_response("image/jpeg", PNG_B64))));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());
        let req = StyleRequest {
            name: "Aarau",
            ..Default::default()
        };

        let first = s.stylize(&req).await.unwrap();
        assert_eq!(first, dir.path().join("Aarau_stylized.jpg"));
        assert_eq!(std::fs::read(&first).unwrap(), STANDARD.decode(PNG_B64).unwrap());

        let second = s.stylize(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resource_exhausted_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        let model = Arc::new(FakeModel::new(move |n, _, _| {
            seen_c.lock().unwrap().push(Instant::now());
            if n < 2 {
                Err(anyhow!("request failed with status 429: RESOURCE_EXHAUSTED"))
            } else {
                Ok(image_response("image/png", PNG_B64))
            }
        }));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());

        let path = s
            .stylize(&StyleRequest {
                name: "Baden",
                ..Default::default()
            })
            .await;

        assert_eq!(path, Some(dir.path().join("Baden_stylized.png")));
        assert_eq!(model.calls(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[1] - seen[0], Duration::from_secs(2));
        assert_eq!(seen[2] - seen[1], Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| Err(anyhow!("status 500: INTERNAL"))));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());
        let req = StyleRequest {
            name: "Bern",
            ..Default::default()
        };
        assert!(s.stylize(&req).await.is_none());
        assert_eq!(model.calls(), 3);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::from_secs(2));
        assert_eq!(backoff(1), Duration::from_secs(4));
        assert_eq!(backoff(4), Duration::from_secs(32));
        assert_eq!(backoff(5), MAX_BACKOFF);
        assert_eq!(backoff(70), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn many_attempts_stay_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| Err(anyhow!("status 500: INTERNAL"))));
        let config = Config {
            images_dir: dir.path().to_path_buf(),
            max_attempts: 70,
            ..Default::default()
        };
        let s = Stylizer::new(&config, model.clone(), Arc::new(FakeFetcher::default()));

        let start = Instant::now();
        let req = StyleRequest {
            name: "Sion",
            ..Default::default()
        };
        assert!(s.stylize(&req).await.is_none());
        assert_eq!(model.calls(), 70);
        // 2 + 4 + 8 + 16 + 32, then 64 waits of one minute
        assert_eq!(start.elapsed(), Duration::from_secs(62 + 64 * 60));
    }

    #[tokio::test]
    async fn unreachable_photo_reference_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| Ok(image_response("image/png", PNG_B64))));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());

        let req = StyleRequest {
            name: "Olten",
            photo_url: Some("https://upload.example/missing.jpg"),
            ..Default::default()
        };
        assert_eq!(s.stylize(&req).await, Some(dir.path().join("Olten_stylized.png")));

        let requests = model.requests.lock().unwrap();
        let parts = &requests[0].1.contents[0].parts;
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].text.as_deref().unwrap().contains("attached reference photo"));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Err(anyhow!("request failed with status 400: INVALID_ARGUMENT"))
        }));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());
        let req = StyleRequest {
            name: "Lugano",
            ..Default::default()
        };
        assert!(s.stylize(&req).await.is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn response_without_image_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::new(|_, _, _| {
            Ok(crate::test_support::text_response("I cannot draw that."))
        }));
        let s = stylizer(dir.path(), model.clone(), FakeFetcher::default());
        let req = StyleRequest {
            name: "Chur",
            ..Default::default()
        };
        assert!(s.stylize(&req).await.is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn references_are_attached_and_failures_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="12"><rect width="10" height="12" fill="blue"/></svg>"#;
        let fetcher = FakeFetcher::default()
            .asset("https://upload.example/Wappen.svg", svg, Some("image/svg+xml"))
            .asset("https://upload.example/empty.jpg", b"", Some("image/jpeg"));
        let model = Arc::new(FakeModel::new(|_, _, _| Ok(image_response("image/png", PNG_B64))));
        let s = stylizer(dir.path(), model.clone(), fetcher);

        let pts = pois(&["Schloss"]);
        let req = StyleRequest {
            name: "Thun",
            geography: Some("the shore of Lake Thun"),
            points_of_interest: &pts,
            photo_url: Some("https://upload.example/empty.jpg"),
            flag_url: Some("https://upload.example/Wappen.svg"),
        };
        assert!(s.stylize(&req).await.is_some());

        let requests = model.requests.lock().unwrap();
        let (model_name, request) = &requests[0];
        assert_eq!(model_name, "gemini-2.5-flash-image");
        let parts = &request.contents[0].parts;
        assert_eq!(parts.len(), 2);
        let prompt = parts[0].text.as_deref().unwrap();
        assert!(prompt.contains("attached flag image"));
        assert!(!prompt.contains("attached reference photo"));
        assert_eq!(parts[1].inline_data.as_ref().unwrap().mime_type, "image/png");
    }
}
