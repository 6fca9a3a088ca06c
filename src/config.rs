use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROJECT: &str = "swiss-gemeinden";
pub const DEFAULT_LOCATION: &str = "global";
pub const DEFAULT_INDEX_URL: &str = "https://de.wikipedia.org/wiki/Liste_Schweizer_Gemeinden";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Resolved run configuration, handed to every component constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub project: String,
    pub location: String,
    pub text_model: String,
    pub image_model: String,
    pub index_url: String,
    pub output_path: PathBuf,
    pub images_dir: PathBuf,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Upper bound on image-generation attempts per municipality.
    pub max_attempts: u32,
    /// Extract the coat of arms and pass it to the stylizer as a reference.
    pub extract_flags: bool,
    pub stylize: bool,
    /// Skip names already present in the output file.
    pub resume: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            index_url: DEFAULT_INDEX_URL.to_string(),
            output_path: PathBuf::from("output/municipalities.json"),
            images_dir: PathBuf::from("output/images"),
            batch_size: 5,
            batch_delay: Duration::from_secs(1),
            max_attempts: 3,
            extract_flags: true,
            stylize: true,
            resume: true,
        }
    }
}

impl Config {
    /// Vertex AI `generateContent` endpoint for `model`.
    pub fn endpoint(&self, model: &str) -> String {
        let host = if self.location == "global" {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{}-aiplatform.googleapis.com", self.location)
        };
        format!(
            "https://{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            host, self.project, self.location, model
        )
    }
}
