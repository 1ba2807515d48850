use crate::catalog;
use crate::config::AppConfig;
use crate::decompose::Decomposer;
use crate::llm::VisionModel;
use crate::metrics;
use crate::models::{ImagePayload, ResultEntry, RetailerLink};
use crate::preview::{LinkMetadata, OpenGraphClient, PreviewResolver, PreviewSource};
use futures::{StreamExt, stream};
use reqwest::Client;
use serde::Serialize;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const FAILURE_MESSAGE: &str = "Failed to analyze outfit. Try again.";

/// Capacity of the update channel between a run and whoever consumes it.
pub const UPDATE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Decomposing,
    Resolving,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_busy(&self) -> bool {
        matches!(self, RunPhase::Decomposing | RunPhase::Resolving)
    }
}

/// What a run tells its consumer, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    Phase(RunPhase),
    Append(ResultEntry),
    /// Drop everything shown so far and show only this entry.
    Replace(ResultEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        items: usize,
        products: usize,
        fallbacks: usize,
    },
    Failed,
    /// The consumer went away before the run finished.
    Abandoned,
}

struct Abandoned;

#[derive(Clone)]
pub struct Pipeline {
    decomposer: Decomposer,
    resolver: PreviewResolver,
    preview_concurrency: usize,
}

impl Pipeline {
    pub fn new(decomposer: Decomposer, resolver: PreviewResolver, preview_concurrency: usize) -> Self {
        Self {
            decomposer,
            resolver,
            preview_concurrency: preview_concurrency.max(1),
        }
    }

    pub fn from_config(config: &AppConfig, http: Client, model: Arc<dyn VisionModel>) -> Self {
        if config.llm.api_key.is_none() {
            warn!(target = "outfit.pipeline", "OPENAI_API_KEY is not set; every run will fail");
        }
        let metadata = OpenGraphClient::from_config(http, &config.opengraph)
            .map(|client| Arc::new(client) as Arc<dyn LinkMetadata>);
        if metadata.is_none() {
            warn!(target = "outfit.pipeline", "OPENGRAPH_APP_ID is not set; previews will use placeholders");
        }
        Self::new(
            Decomposer::new(model),
            PreviewResolver::new(metadata, &config.preview),
            config.preview.concurrency,
        )
    }

    /// Runs to completion and returns the final entry sequence.
    pub async fn run(&self, image: ImagePayload) -> Vec<ResultEntry> {
        let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
        let collect = async {
            let mut entries = Vec::new();
            while let Some(update) = rx.recv().await {
                apply_update(&mut entries, update);
            }
            entries
        };
        let (_, entries) = tokio::join!(self.run_into(image, tx), collect);
        entries
    }

    /// Streams updates into `updates` as they become final. Dropping the
    /// receiver abandons the run and cancels any lookups still in flight.
    pub async fn run_into(&self, image: ImagePayload, updates: mpsc::Sender<RunUpdate>) -> RunOutcome {
        let started = Instant::now();
        let outcome = match self.drive(image, &updates).await {
            Ok(outcome) => outcome,
            Err(Abandoned) => {
                info!(target = "outfit.pipeline", "run_abandoned");
                RunOutcome::Abandoned
            }
        };
        metrics::run_settled(&outcome, started.elapsed());
        outcome
    }

    async fn drive(
        &self,
        image: ImagePayload,
        updates: &mpsc::Sender<RunUpdate>,
    ) -> Result<RunOutcome, Abandoned> {
        emit(updates, RunUpdate::Phase(RunPhase::Decomposing)).await?;
        emit(updates, RunUpdate::Append(ResultEntry::echo(&image))).await?;
        info!(target = "outfit.pipeline", mime = %image.mime_type(), "run_started");

        let (decomposed, elapsed) = timed(self.decomposer.decompose(&image)).await;
        metrics::decompose_elapsed(decomposed.as_ref().ok().map(Vec::len), elapsed);
        let items = match decomposed {
            Ok(items) => items,
            Err(err) => {
                warn!(target = "outfit.pipeline", error = %err, "run_failed");
                emit(updates, RunUpdate::Replace(ResultEntry::failure(FAILURE_MESSAGE))).await?;
                emit(updates, RunUpdate::Phase(RunPhase::Failed)).await?;
                return Ok(RunOutcome::Failed);
            }
        };
        if items.is_empty() {
            info!(target = "outfit.pipeline", "outfit_empty_decomposition");
        }

        emit(updates, RunUpdate::Phase(RunPhase::Resolving)).await?;
        let links: Vec<RetailerLink> = items.iter().flat_map(catalog::links_for).collect();
        debug!(
            target = "outfit.pipeline",
            items = items.len(),
            links = links.len(),
            concurrency = self.preview_concurrency,
            "resolving_previews"
        );

        let link_count = links.len();
        let resolving = Instant::now();
        let resolver = &self.resolver;
        // `buffered` yields in input order, so emission stays item-major and
        // retailer-minor whatever order the lookups finish in.
        let mut previews = stream::iter(links)
            .map(|link| async move {
                let preview = resolver.resolve(&link).await;
                (link, preview)
            })
            .buffered(self.preview_concurrency);

        let mut products = 0;
        let mut fallbacks = 0;
        while let Some((link, preview)) = previews.next().await {
            if preview.source == PreviewSource::Fallback {
                fallbacks += 1;
            }
            emit(updates, RunUpdate::Append(ResultEntry::product(link, preview.url))).await?;
            products += 1;
        }
        metrics::previews_elapsed(link_count, self.preview_concurrency, resolving.elapsed());

        emit(updates, RunUpdate::Phase(RunPhase::Done)).await?;
        info!(
            target = "outfit.pipeline",
            items = items.len(),
            products,
            fallbacks,
            "run_completed"
        );
        Ok(RunOutcome::Completed {
            items: items.len(),
            products,
            fallbacks,
        })
    }
}

pub fn apply_update(entries: &mut Vec<ResultEntry>, update: RunUpdate) {
    match update {
        RunUpdate::Phase(_) => {}
        RunUpdate::Append(entry) => entries.push(entry),
        RunUpdate::Replace(entry) => {
            entries.clear();
            entries.push(entry);
        }
    }
}

async fn emit(updates: &mpsc::Sender<RunUpdate>, update: RunUpdate) -> Result<(), Abandoned> {
    updates.send(update).await.map_err(|_| Abandoned)
}

async fn timed<T, Fut>(fut: Fut) -> (T, Duration)
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let value = fut.await;
    (value, started.elapsed())
}
