//! Regulatory Monitor (spec.md §4.1).

pub mod parser;

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::error::{CoreError, CoreResult};
use crate::http::HttpFetcher;
use crate::store::Store;
use crate::types::{RegulatoryItem, RegulatorySource, SourceType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parser::{ApiParser, HtmlParser, RssParser, SourceParser};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub items_detected: u64,
    pub duplicates_avoided: u64,
    pub active_sources: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub items_detected: u64,
    pub duplicates_avoided: u64,
}

pub struct Monitor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn HttpFetcher>,
    config: MonitorConfig,
    counters: MonitorCounters,
    source_stats: DashMap<String, SourceStats>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Default)]
struct MonitorCounters {
    total_checks: AtomicU64,
    successful_checks: AtomicU64,
    failed_checks: AtomicU64,
    items_detected: AtomicU64,
    duplicates_avoided: AtomicU64,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn HttpFetcher>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            fetcher,
            config,
            counters: MonitorCounters::default(),
            source_stats: DashMap::new(),
            worker: Mutex::new(None),
        })
    }

    pub async fn add_source(&self, source: RegulatorySource) -> CoreResult<()> {
        if source.id.is_empty() || source.base_url.is_empty() {
            return Err(CoreError::validation("source id and base_url must be non-empty"));
        }
        self.store.upsert_source(&source).await
    }

    pub async fn update_source(&self, id: &str, source: RegulatorySource) -> CoreResult<()> {
        if self.store.get_source(id).await?.is_none() {
            return Err(CoreError::not_found("source", id));
        }
        self.store.upsert_source(&source).await
    }

    pub async fn remove_source(&self, id: &str) -> CoreResult<bool> {
        self.store.remove_source(id).await
    }

    pub async fn list_sources(&self) -> CoreResult<Vec<RegulatorySource>> {
        self.store.list_sources().await
    }

    /// Rewinds `last_check` so the source is included in the next sweep
    /// regardless of its `check_interval_minutes`.
    pub async fn force_check(&self, id: &str) -> CoreResult<()> {
        let Some(mut source) = self.store.get_source(id).await? else {
            return Err(CoreError::not_found("source", id));
        };
        source.last_check = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or(Utc::now());
        self.store.upsert_source(&source).await
    }

    pub async fn stats(&self) -> CoreResult<MonitorStats> {
        let active_sources = self.store.list_sources().await?.iter().filter(|s| s.active).count() as u64;
        Ok(MonitorStats {
            total_checks: self.counters.total_checks.load(Ordering::Relaxed),
            successful_checks: self.counters.successful_checks.load(Ordering::Relaxed),
            failed_checks: self.counters.failed_checks.load(Ordering::Relaxed),
            items_detected: self.counters.items_detected.load(Ordering::Relaxed),
            duplicates_avoided: self.counters.duplicates_avoided.load(Ordering::Relaxed),
            active_sources,
        })
    }

    pub fn source_stats(&self, id: &str) -> Option<SourceStats> {
        self.source_stats.get(id).map(|s| s.clone())
    }

    /// Direct insertion path for `StoreItem` (spec.md §6), independent of
    /// the sweep; bumps the same dedup counters a sweep-discovered item
    /// would.
    pub async fn store_item(&self, item: RegulatoryItem) -> CoreResult<bool> {
        let inserted = self.store.insert_item_if_absent(&item).await?;
        if inserted {
            self.counters.items_detected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.duplicates_avoided.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    pub async fn get_recent_items(&self, limit: usize) -> CoreResult<Vec<RegulatoryItem>> {
        self.store.list_recent_items(limit).await
    }

    /// Runs one sweep cycle synchronously; used directly by tests and by
    /// the background worker loop.
    #[instrument(skip(self))]
    pub async fn run_sweep_once(&self) -> CoreResult<()> {
        let now = self.clock.now();
        let sources = self.store.list_sources().await?;
        for source in sources.into_iter().filter(|s| s.should_check(now)) {
            self.check_source(source, now).await;
        }
        Ok(())
    }

    async fn check_source(&self, mut source: RegulatorySource, now: DateTime<Utc>) {
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);
        self.source_stats.entry(source.id.clone()).or_default().total_checks += 1;

        let fetched = self.fetcher.get(&source.base_url).await;
        if !fetched.success {
            source.consecutive_failures += 1;
            self.counters.failed_checks.fetch_add(1, Ordering::Relaxed);
            self.source_stats.entry(source.id.clone()).or_default().failed_checks += 1;
            warn!(source = %source.id, error = ?fetched.error_message, "source fetch failed");
            if let Err(e) = self.store.upsert_source(&source).await {
                warn!(source = %source.id, error = %e, "failed to persist source failure state");
            }
            return;
        }

        let parser: &dyn SourceParser = match source.source_type {
            SourceType::Rss => &RssParser,
            SourceType::Html => &HtmlParser,
            SourceType::Api => &ApiParser,
        };
        let candidates = parser.parse(&fetched.body, &source.base_url);

        for candidate in candidates {
            let digest_input = format!("{}:{}:{}", source.id, candidate.title, candidate.published_at.timestamp_nanos_opt().unwrap_or_default());
            let id = format!("{}_{:x}", source.id, Sha256::digest(digest_input.as_bytes()));
            let item = RegulatoryItem {
                id,
                source: source.id.clone(),
                title: candidate.title,
                description: candidate.description,
                content_url: candidate.content_url,
                change_type: candidate.change_type,
                severity: candidate.severity,
                metadata: serde_json::json!({}),
                detected_at: now,
                published_at: candidate.published_at,
            };
            match self.store.insert_item_if_absent(&item).await {
                Ok(true) => {
                    self.counters.items_detected.fetch_add(1, Ordering::Relaxed);
                    self.source_stats.entry(source.id.clone()).or_default().items_detected += 1;
                }
                Ok(false) => {
                    self.counters.duplicates_avoided.fetch_add(1, Ordering::Relaxed);
                    self.source_stats.entry(source.id.clone()).or_default().duplicates_avoided += 1;
                }
                Err(e) => warn!(source = %source.id, error = %e, "failed to persist regulatory item"),
            }
        }

        source.consecutive_failures = 0;
        source.last_check = now;
        self.counters.successful_checks.fetch_add(1, Ordering::Relaxed);
        self.source_stats.entry(source.id.clone()).or_default().successful_checks += 1;
        if let Err(e) = self.store.upsert_source(&source).await {
            warn!(source = %source.id, error = %e, "failed to persist source success state");
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let worker_token = token.clone();
        let interval = std::time::Duration::from_secs(monitor.config.monitoring_interval_seconds);
        let handle = tokio::spawn(async move {
            info!("regulatory monitor worker starting");
            loop {
                if let Err(e) = monitor.run_sweep_once().await {
                    warn!(error = %e, "sweep cycle failed");
                }
                if !monitor.clock.sleep_cancellable(interval, &worker_token).await {
                    break;
                }
            }
            info!("regulatory monitor worker stopped");
        });
        *guard = Some((token, handle));
    }

    pub async fn stop(&self) {
        let mut guard = self.worker.lock().await;
        if let Some((token, handle)) = guard.take() {
            token.cancel();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::http::test_support::MockFetcher;
    use crate::http::FetchResult;
    use crate::store::memory::InMemoryStore;

    fn source(id: &str, source_type: SourceType) -> RegulatorySource {
        RegulatorySource {
            id: id.to_string(),
            name: id.to_string(),
            base_url: format!("http://example.test/{id}"),
            source_type,
            check_interval_minutes: 60,
            active: true,
            scraping_config: serde_json::json!({}),
            last_check: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn dedups_across_two_sweeps_of_the_same_feed() {
        let store = Arc::new(InMemoryStore::new());
        let clock = TestClock::new(Utc::now());
        let fetcher = Arc::new(MockFetcher::new());
        let body = r#"<rss><channel>
            <item><title>New Commission Rule</title><link>http://x/a</link>
            <description>d</description></item>
        </channel></rss>"#;
        fetcher
            .set("http://example.test/sec", FetchResult { success: true, body: body.to_string(), error_message: None })
            .await;

        let monitor = Monitor::new(store, clock.clone(), fetcher, MonitorConfig { monitoring_interval_seconds: 60, max_consecutive_failures: 5 });
        monitor.add_source(source("sec", SourceType::Rss)).await.unwrap();

        monitor.run_sweep_once().await.unwrap();
        clock.advance(std::time::Duration::from_secs(3600));
        monitor.run_sweep_once().await.unwrap();

        let stats = monitor.stats().await.unwrap();
        assert_eq!(stats.items_detected, 1);
        assert_eq!(stats.duplicates_avoided, 1);
        assert_eq!(stats.active_sources, 1);
        let source = monitor.list_sources().await.unwrap().into_iter().next().unwrap();
        assert_eq!(source.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn circuit_opens_after_five_consecutive_failures() {
        let store = Arc::new(InMemoryStore::new());
        let clock = TestClock::new(Utc::now());
        let fetcher = Arc::new(MockFetcher::new());
        let monitor = Monitor::new(store, clock.clone(), fetcher, MonitorConfig { monitoring_interval_seconds: 60, max_consecutive_failures: 5 });
        monitor.add_source(source("flaky", SourceType::Html)).await.unwrap();

        for _ in 0..5 {
            monitor.run_sweep_once().await.unwrap();
            clock.advance(std::time::Duration::from_secs(3700));
        }

        let stored = monitor.list_sources().await.unwrap().into_iter().next().unwrap();
        assert_eq!(stored.consecutive_failures, 5);
        assert!(!stored.should_check(clock.now()));
    }

    #[tokio::test]
    async fn force_check_rearms_a_recently_checked_source() {
        let store = Arc::new(InMemoryStore::new());
        let clock = TestClock::new(Utc::now());
        let fetcher = Arc::new(MockFetcher::new());
        let monitor = Monitor::new(store, clock.clone(), fetcher, MonitorConfig { monitoring_interval_seconds: 60, max_consecutive_failures: 5 });
        let mut src = source("api", SourceType::Api);
        src.last_check = clock.now();
        monitor.add_source(src).await.unwrap();

        assert!(!monitor.list_sources().await.unwrap()[0].should_check(clock.now()));
        monitor.force_check("api").await.unwrap();
        assert!(monitor.list_sources().await.unwrap()[0].should_check(clock.now()));
    }
}
