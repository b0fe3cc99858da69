use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use config::ConfigError;
use serde::Serialize;
use sluice_core::PeerId;
use sluice_node::{FetcherError, FetcherService, FetcherStats};
use sluice_transport::{ChannelDisconnector, ChannelTransport};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::sink::{build_corpus, classify_bench_reject, BenchSink};

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("fetcher: {0}")]
    Fetcher(#[from] FetcherError),
    #[error("report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("flood task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub duration_ms: u64,
    pub peers: usize,
    pub items_per_delivery: usize,
    pub validation_rounds: u32,
    pub deliveries: u64,
    pub validations: u64,
    pub failures: u64,
    pub cooldowns: u64,
    pub disconnects: u64,
    pub disconnected_peers: usize,
    pub avg_validations_per_sec: f64,
    pub stats: FetcherStats,
}

impl BenchReport {
    /// `key=value` lines for terminal output.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "duration={:?} peers={} items_per_delivery={} validation_rounds={}",
                Duration::from_millis(self.duration_ms),
                self.peers,
                self.items_per_delivery,
                self.validation_rounds
            ),
            format!(
                "validations={} failures={} cooldowns={} disconnects={} disconnected_peers={}",
                self.validations,
                self.failures,
                self.cooldowns,
                self.disconnects,
                self.disconnected_peers
            ),
        ];
        if self.validations > 0 {
            lines.push(format!(
                "avg_validations_per_sec={:.2}",
                self.avg_validations_per_sec
            ));
        }
        lines
    }
}

type Flagged = Arc<Mutex<HashSet<PeerId>>>;

fn is_flagged(flagged: &Flagged, peer: &PeerId) -> bool {
    flagged
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .contains(peer)
}

/// Floods a fetcher with deliveries from `peers` concurrent peers for the
/// configured duration, then reports what the sink and the abuse policy saw.
pub async fn run_flood(cfg: &BenchConfig) -> Result<BenchReport, BenchError> {
    let fetcher_cfg = cfg.fetcher_config();
    fetcher_cfg.validate()?;

    let corpus = Arc::new(build_corpus(cfg));
    let sink = BenchSink::new(cfg.validation_rounds);
    let counters = sink.clone();

    let (transport, mut outbound) = ChannelTransport::new(fetcher_cfg.command_queue_capacity);
    let (disconnector, mut signals) = ChannelDisconnector::new();
    // Nothing is announced, so the wire side only needs draining.
    let wire = tokio::spawn(async move { while outbound.recv().await.is_some() {} });

    let flagged: Flagged = Arc::default();
    let watcher = tokio::spawn({
        let flagged = Arc::clone(&flagged);
        async move {
            let mut signalled = 0_u64;
            while let Some((peer, reason)) = signals.recv().await {
                signalled += 1;
                info!("bench: disconnect requested for {}: {}", peer, reason);
                flagged
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(peer);
            }
            signalled
        }
    });

    let service = FetcherService::start(
        fetcher_cfg,
        sink,
        classify_bench_reject,
        transport,
        disconnector,
    )?;

    info!(
        "bench: flooding with {} peers x {} items for {:?} (corpus={}, rounds={})",
        cfg.peers,
        cfg.items_per_delivery,
        cfg.duration,
        corpus.len(),
        cfg.validation_rounds
    );

    let started = Instant::now();
    let stop = started + cfg.duration;
    let mut tasks = Vec::with_capacity(cfg.peers);
    for peer_index in 0..cfg.peers {
        let handle = service.handle();
        let corpus = Arc::clone(&corpus);
        let flagged = Arc::clone(&flagged);
        let honor = cfg.honor_disconnects;
        let per_delivery = cfg.items_per_delivery;
        tasks.push(tokio::spawn(async move {
            let peer = PeerId::new(format!("peer-{peer_index}"));
            let mut cursor = ((peer_index as u64) << 32) as usize % corpus.len().max(1);
            let mut deliveries = 0_u64;
            while Instant::now() < stop {
                if honor && is_flagged(&flagged, &peer) {
                    debug!("bench: {} dropped by the fetcher, stopping", peer);
                    break;
                }
                let mut batch = Vec::with_capacity(per_delivery);
                for _ in 0..per_delivery {
                    batch.push(corpus[cursor]);
                    cursor = (cursor + 1) % corpus.len();
                }
                match handle.deliver(peer.clone(), batch, true).await {
                    Ok(_) => deliveries += 1,
                    Err(err) => {
                        warn!("bench: {} delivery failed: {}", peer, err);
                        break;
                    }
                }
            }
            deliveries
        }));
    }

    let mut deliveries = 0;
    for task in tasks {
        deliveries += task
            .await
            .map_err(|err| BenchError::Join(err.to_string()))?;
    }
    let elapsed = started.elapsed();

    let stats = service.handle().stats().await?;
    service.stop().await?;
    // The service owned the only disconnector; its channel is closed now.
    let disconnects = watcher
        .await
        .map_err(|err| BenchError::Join(err.to_string()))?;
    wire.abort();

    let validations = counters.validations();
    let disconnected_peers = flagged
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len();
    Ok(BenchReport {
        duration_ms: elapsed.as_millis() as u64,
        peers: cfg.peers,
        items_per_delivery: cfg.items_per_delivery,
        validation_rounds: cfg.validation_rounds,
        deliveries,
        validations,
        failures: counters.failures(),
        cooldowns: stats.cooldowns,
        disconnects,
        disconnected_peers,
        avg_validations_per_sec: validations as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::run_flood;
    use crate::config::BenchConfig;

    fn quick_config() -> BenchConfig {
        BenchConfig {
            duration: Duration::from_millis(400),
            peers: 3,
            items_per_delivery: 16,
            validation_rounds: 8,
            invalid_percent: 100,
            item_kind: 3,
            item_size: 1024,
            corpus_size: 0,
            honor_disconnects: true,
            report_path: None,
            add_batch_size: 16,
            max_validation_workers: 4,
            cooldown_fraction: 1.0,
            cooldown: Duration::from_millis(5),
            sustained_reject_threshold: 0.10,
            sustained_batches: 2,
            item_cost: 1.0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_flood_gets_every_peer_disconnected() {
        let cfg = quick_config();
        let report = tokio::time::timeout(Duration::from_secs(10), run_flood(&cfg))
            .await
            .expect("flood should finish")
            .expect("flood should succeed");

        assert!(report.validations > 0);
        assert_eq!(report.failures, report.validations);
        assert_eq!(report.disconnected_peers, cfg.peers);
        assert!(report.disconnects >= cfg.peers as u64);
        assert_eq!(report.stats.disconnect_signals, report.disconnects);
        assert_eq!(report.cooldowns, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn valid_flood_is_never_penalized() {
        let cfg = BenchConfig {
            invalid_percent: 0,
            duration: Duration::from_millis(200),
            ..quick_config()
        };
        let report = run_flood(&cfg).await.expect("flood should succeed");

        assert_eq!(report.failures, 0);
        assert_eq!(report.disconnects, 0);
        assert_eq!(report.cooldowns, 0);
        let json = serde_json::to_value(&report).expect("report should serialize");
        assert_eq!(json["disconnects"], 0);
        assert!(json["stats"]["outcomes_accepted"].as_u64().is_some());
    }
}
