use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::Config;
use crate::detail::DetailExtractor;
use crate::fetch::Fetcher;
use crate::gemini::GenerativeModel;
use crate::index::{fetch_municipality_links, MunicipalityLink};
use crate::store::{load_results, save_results, MunicipalityRecord};

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub discovered: usize,
    pub previous: usize,
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub with_image: usize,
    pub stylized: usize,
    pub batches: usize,
    pub saves: usize,
}

impl CrawlSummary {
    pub fn print(&self) {
        println!(
            "Saved {} municipalities ({} with image, {} stylized). This run: {} processed, {} failed in {} batches.",
            self.total, self.with_image, self.stylized, self.processed, self.failed, self.batches
        );
    }
}

pub struct Crawler {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    extractor: DetailExtractor,
}

impl Crawler {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>, model: Arc<dyn GenerativeModel>) -> Self {
        let extractor = DetailExtractor::new(&config, fetcher.clone(), model);
        Self {
            config,
            fetcher,
            extractor,
        }
    }

    /// Discover, resume, then process pending municipalities batch by batch,
    /// rewriting the output file after every batch.
    pub async fn run(&self) -> Result<CrawlSummary> {
        let discovered =
            fetch_municipality_links(self.fetcher.as_ref(), &self.config.index_url).await?;

        let mut results = if self.config.resume {
            load_results(&self.config.output_path).await
        } else {
            Vec::new()
        };
        let pending = pending_links(&discovered, &results);

        let mut summary = CrawlSummary {
            discovered: discovered.len(),
            previous: results.len(),
            pending: pending.len(),
            ..Default::default()
        };
        info!(
            "{} discovered, {} already saved, {} pending",
            summary.discovered, summary.previous, summary.pending
        );

        let batch_size = self.config.batch_size.max(1);
        let pb = ProgressBar::new(pending.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        for (i, batch) in pending.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let outcomes = join_all(batch.iter().map(|link| self.extractor.extract(link))).await;
            for record in outcomes {
                match record {
                    Some(record) => {
                        summary.processed += 1;
                        results.push(record);
                    }
                    None => summary.failed += 1,
                }
            }

            save_results(&self.config.output_path, &results).await?;
            summary.batches += 1;
            summary.saves += 1;
            pb.inc(batch.len() as u64);
            info!(
                "Batch {} done: {} results saved to {}",
                i + 1,
                results.len(),
                self.config.output_path.display()
            );
        }
        pb.finish_and_clear();

        summary.total = results.len();
        summary.with_image = results.iter().filter(|r| r.image_url.is_some()).count();
        summary.stylized = results
            .iter()
            .filter(|r| r.stylized_image_path.is_some())
            .count();
        info!(
            "Finished: {} municipalities, {} with image",
            summary.total, summary.with_image
        );
        Ok(summary)
    }
}

/// Discovered links whose name is not yet among the saved records, in discovery order.
pub fn pending_links(
    discovered: &[MunicipalityLink],
    saved: &[MunicipalityRecord],
) -> Vec<MunicipalityLink> {
    let done: HashSet<&str> = saved.iter().map(|r| r.name.as_str()).collect();
    discovered
        .iter()
        .filter(|l| !done.contains(l.name.as_str()))
        .cloned()
        .collect()
}
