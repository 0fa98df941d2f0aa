use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::metrics::RelayMetrics;
use crate::output::{spawn_packet_worker, OutputManager, WorkerContext};
use crate::packet::{Packet, StreamInfo};
use crate::registry::Registry;
use crate::{IngestName, OutputScheme};

/// Declared-vs-live output diff cadence.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);
/// Queue fill-ratio observation cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of one live publisher: the reader fans packets out to every
/// worker queue without blocking, while the reconciler keeps the worker
/// set equal to the declared outputs list.
pub struct IngestSession {
    name: IngestName,
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    info: Arc<RwLock<StreamInfo>>,
    source: mpsc::UnboundedReceiver<Packet>,
}

impl IngestSession {
    pub fn new(
        name: IngestName,
        registry: Arc<Registry>,
        metrics: Arc<RelayMetrics>,
        info: Arc<RwLock<StreamInfo>>,
        source: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self {
            name,
            registry,
            metrics,
            info,
            source,
        }
    }

    pub async fn run(mut self) {
        let name = self.name.clone();
        self.registry.set_ingest_active(&name, true).await;
        self.metrics.session_started();

        let manager: Arc<OutputManager<Packet>> = Arc::new(OutputManager::new());
        let capacity = self.registry.queue_capacity().await;

        for url in self.registry.output_urls(&name).await {
            start_worker(
                &manager,
                &self.registry,
                &self.metrics,
                &self.info,
                &name,
                &url,
                capacity,
            )
            .await;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = tokio::spawn(reconcile_loop(
            manager.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.info.clone(),
            name.clone(),
            capacity,
            stop_rx,
        ));

        // reader loop: non-blocking enqueue per worker, drop on overflow
        let mut dropped_total: u64 = 0;
        while let Some(packet) = self.source.recv().await {
            let outputs = manager.all_outputs().await;
            let mut forwarded = 0u64;
            let mut dropped = 0u64;
            for (url, queue) in &outputs {
                match queue.try_send(packet.clone()) {
                    Ok(()) => forwarded += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        log::warn!("Output queue full, dropping packet for {}", url);
                    }
                    // worker is draining out; the reconciler cleans up
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            self.metrics.forwarded(forwarded);
            if dropped > 0 {
                self.metrics.dropped(dropped);
                dropped_total += dropped;
                if dropped as usize == outputs.len() && !outputs.is_empty() {
                    log::error!(
                        "All {} outputs of ingest {} are saturated, packet dropped everywhere",
                        outputs.len(),
                        name
                    );
                }
            }
        }

        log::info!(
            "Source finished for ingest {} ({} packets dropped in total)",
            name,
            dropped_total
        );

        let _ = stop_tx.send(true);
        let _ = reconciler.await;
        manager.close_all().await;

        for url in self.registry.output_urls(&name).await {
            self.registry.set_output_active(&name, &url, false).await;
        }
        self.registry.set_ingest_active(&name, false).await;
        self.metrics.session_finished();
    }
}

async fn start_worker(
    manager: &OutputManager<Packet>,
    registry: &Arc<Registry>,
    metrics: &Arc<RelayMetrics>,
    info: &Arc<RwLock<StreamInfo>>,
    name: &str,
    url: &str,
    capacity: usize,
) {
    if OutputScheme::of(url).is_none() {
        log::warn!("Ignoring output with unsupported scheme: {}", url);
        return;
    }
    registry.register_output(name, url).await;

    let ctx = WorkerContext {
        ingest: name.to_string(),
        url: url.to_string(),
        registry: registry.clone(),
        metrics: metrics.clone(),
        info: info.clone(),
    };
    manager
        .add_output(url, capacity, move |queue, stop| {
            spawn_packet_worker(ctx, queue, stop);
        })
        .await;
}

async fn reconcile_loop(
    manager: Arc<OutputManager<Packet>>,
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    info: Arc<RwLock<StreamInfo>>,
    name: IngestName,
    capacity: usize,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut reconcile = interval(RECONCILE_INTERVAL);
    let mut monitor = interval(MONITOR_INTERVAL);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = reconcile.tick() => {
                let declared = registry.output_urls(&name).await;
                for url in &declared {
                    start_worker(&manager, &registry, &metrics, &info, &name, url, capacity).await;
                }
                for url in manager.urls().await {
                    if !declared.contains(&url) {
                        log::info!("Output removed from ingest {}: {}", name, url);
                        manager.remove_output(&url).await;
                    }
                }
            }
            _ = monitor.tick() => {
                let fills = manager.queue_fill().await;
                log::info!(
                    "Ingest {} up {:?}, {} outputs",
                    name,
                    started.elapsed(),
                    fills.len()
                );
                for (url, queued, cap) in fills {
                    let percent = queued * 100 / cap.max(1);
                    if percent > 75 {
                        log::warn!(
                            "Output queue for {} is {}% full: {}/{} packets",
                            url, percent, queued, cap
                        );
                    } else if percent > 50 {
                        log::warn!("Output queue for {} filling up: {}/{}", url, queued, cap);
                    } else {
                        log::debug!("Output queue for {}: {}/{}", url, queued, cap);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestCfg, Settings};
    use std::path::PathBuf;

    fn test_registry(outputs: Vec<&str>) -> Arc<Registry> {
        let settings = Settings {
            inputs: vec![IngestCfg {
                name: "live".to_string(),
                url_path: "/live/a".to_string(),
                outputs: outputs.into_iter().map(String::from).collect(),
            }],
            ..Settings::default()
        };
        Arc::new(Registry::new(settings, PathBuf::from("config.yaml")))
    }

    #[tokio::test]
    async fn session_marks_ingest_active_and_inactive() {
        let registry = test_registry(vec![]);
        let metrics = RelayMetrics::new();
        let info = Arc::new(RwLock::new(StreamInfo::default()));
        let (tx, rx) = mpsc::unbounded_channel();

        let session = IngestSession::new(
            "live".to_string(),
            registry.clone(),
            metrics.clone(),
            info,
            rx,
        );
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.status("live").await.unwrap().active);

        drop(tx);
        handle.await.unwrap();
        let status = registry.status("live").await.unwrap();
        assert!(!status.active);
        assert_eq!(metrics.snapshot().sessions_active, 0);
    }

    #[tokio::test]
    async fn workers_follow_declared_outputs_within_one_tick() {
        let registry = test_registry(vec![]);
        let metrics = RelayMetrics::new();
        let info = Arc::new(RwLock::new(StreamInfo::default()));
        let (tx, rx) = mpsc::unbounded_channel::<Packet>();

        let session = IngestSession::new(
            "live".to_string(),
            registry.clone(),
            metrics,
            info,
            rx,
        );
        let handle = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // declare an output at runtime: a worker must appear and register
        // its status entry within one reconciliation tick
        registry
            .add_output_url("live", "file:///tmp/xrelay_reconcile_test.flv")
            .await
            .unwrap();
        tokio::time::sleep(RECONCILE_INTERVAL + Duration::from_millis(500)).await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs.len(), 1);

        // remove it: the status entry disappears after cleanup
        registry
            .remove_output_url("live", "file:///tmp/xrelay_reconcile_test.flv")
            .await
            .unwrap();
        tokio::time::sleep(RECONCILE_INTERVAL + Duration::from_millis(500)).await;
        let status = registry.status("live").await.unwrap();
        assert!(status.outputs.is_empty());

        drop(tx);
        handle.await.unwrap();
        let _ = std::fs::remove_file("/tmp/xrelay_reconcile_test.flv");
    }
}
