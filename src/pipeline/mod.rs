//! Scheduling pipeline.
//!
//! - `adapter`: fetch adapter and sink seams, plus the bundled implementations
//! - `context`: services shared by every task
//! - `scheduler`: the cycle loop
//!
//! [`build_scheduler`] wires everything from a [`Config`].

pub mod adapter;
pub mod context;
pub mod due_queue;
pub mod outcome;
pub mod scheduler;

pub use adapter::{FeedCache, FeedItem, FetchAdapter, Sink, StdoutSink};
#[cfg(feature = "http")]
pub use adapter::{HttpFeedAdapter, WebhookSink};
pub use context::{EngineContext, EngineStatus, RestoreReport, SourceStatus};
pub use due_queue::DueQueue;
pub use outcome::{DomainStats, OutcomeLog};
pub use scheduler::{GcReport, Scheduler, StartState};

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{Config, SinkKind};
use crate::storage::SnapshotStore;
use crate::utils::clock::Clock;

/// Build a scheduler with the bundled adapters and the configured sink.
///
/// Sources with a `feed_url` get an [`HttpFeedAdapter`]; the rest run
/// without an adapter until the embedding program registers one, and fail
/// their attempts meanwhile.
pub fn build_scheduler(
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
) -> Result<Scheduler> {
    let ctx = Arc::new(EngineContext::from_config(&config, clock)?);

    #[cfg(feature = "http")]
    let client = crate::utils::http::create_async_client(&config.http)?;

    let sink: Arc<dyn Sink> = match (config.sink.kind, &config.sink.url) {
        (SinkKind::Stdout, _) => Arc::new(StdoutSink),
        #[cfg(feature = "http")]
        (SinkKind::Webhook, Some(url)) => Arc::new(WebhookSink::new(client.clone(), url)),
        #[cfg(feature = "http")]
        (SinkKind::Webhook, None) => {
            return Err(AppError::config("sink.url is required for the webhook sink"));
        }
        #[cfg(not(feature = "http"))]
        (SinkKind::Webhook, _) => {
            return Err(AppError::config("the webhook sink needs the `http` feature"));
        }
    };

    let mut scheduler = Scheduler::new(Arc::clone(&ctx), Arc::clone(&config), sink);

    for source in &config.sources {
        let Some(feed_url) = &source.feed_url else {
            continue;
        };
        let domain = source.validate()?;

        #[cfg(feature = "http")]
        {
            let adapter = HttpFeedAdapter::new(
                client.clone(),
                feed_url,
                source.store_filter.clone(),
                Arc::clone(&ctx.cache),
            );
            scheduler = scheduler.with_adapter(&domain, Arc::new(adapter));
        }
        #[cfg(not(feature = "http"))]
        log::warn!(
            "{} has feed {} but HTTP support is disabled",
            domain,
            feed_url
        );
    }

    if let Some(store) = store {
        scheduler = scheduler.with_store(store);
    }
    Ok(scheduler)
}
