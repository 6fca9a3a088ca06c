mod config;
mod crawl;
mod detail;
mod fetch;
mod gemini;
mod index;
mod resolver;
mod store;
mod stylize;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use config::Config;
use crawl::Crawler;
use fetch::HttpFetcher;
use gemini::VertexClient;

#[derive(Parser)]
#[command(
    name = "gemeinde_crawler",
    about = "Crawl Swiss municipalities from Wikipedia and build a stylized dataset"
)]
struct Cli {
    /// Google Cloud project for Vertex AI
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT", default_value = config::DEFAULT_PROJECT)]
    project: String,
    /// Vertex AI location ("global" or a region such as europe-west6)
    #[arg(long, env = "GOOGLE_CLOUD_LOCATION", default_value = config::DEFAULT_LOCATION)]
    location: String,
    /// OAuth access token (default: `gcloud auth print-access-token`)
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    /// Municipality list page
    #[arg(long, default_value = config::DEFAULT_INDEX_URL)]
    index_url: String,
    /// Results file, rewritten after every batch
    #[arg(long, default_value = "output/municipalities.json")]
    output: PathBuf,
    /// Directory for stylized images
    #[arg(long, default_value = "output/images")]
    images_dir: PathBuf,
    /// Municipalities processed concurrently per batch
    #[arg(long, default_value = "5")]
    batch_size: usize,
    /// Pause between batches in milliseconds
    #[arg(long, default_value = "1000")]
    batch_delay_ms: u64,
    /// Image generation attempts on transient errors
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..=10))]
    max_attempts: u32,
    #[arg(long, default_value = config::DEFAULT_TEXT_MODEL)]
    text_model: String,
    #[arg(long, default_value = config::DEFAULT_IMAGE_MODEL)]
    image_model: String,
    /// Skip coat of arms extraction and reference images
    #[arg(long)]
    no_flags: bool,
    /// Skip stylized image generation
    #[arg(long)]
    no_stylize: bool,
    /// Process every municipality again instead of resuming
    #[arg(long)]
    reprocess: bool,
}

impl Cli {
    fn into_config(self) -> (Config, Option<String>) {
        let config = Config {
            project: self.project,
            location: self.location,
            text_model: self.text_model,
            image_model: self.image_model,
            index_url: self.index_url,
            output_path: self.output,
            images_dir: self.images_dir,
            batch_size: self.batch_size,
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            max_attempts: self.max_attempts,
            extract_flags: !self.no_flags,
            stylize: !self.no_stylize,
            resume: !self.reprocess,
        };
        (config, self.access_token)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let (config, access_token) = Cli::parse().into_config();
    tracing::info!(
        "Using project {} in {}",
        config.project,
        config.location
    );

    let fetcher = Arc::new(HttpFetcher::new()?);
    let model = Arc::new(VertexClient::new(&config, access_token)?);
    let summary = Crawler::new(config, fetcher, model).run().await?;
    summary.print();

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
