mod file;
mod rtmp_out;
mod srt_out;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify, RwLock};

use crate::metrics::RelayMetrics;
use crate::packet::{Packet, StreamInfo};
use crate::registry::Registry;
use crate::{OutputScheme, OutputUrl};

/// How a sink run ended, seen from the worker's outer reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop signal observed or the packet queue closed. Terminal.
    Stopped,
    /// Explicit reconnect requested through the control plane; the error
    /// count was already bumped there.
    Reconnect,
}

pub(crate) type SinkResult = anyhow::Result<WorkerExit>;

/// Everything a worker needs to run against one (ingest, URL) pair.
#[derive(Clone)]
pub struct WorkerContext {
    pub ingest: String,
    pub url: OutputUrl,
    pub registry: Arc<Registry>,
    pub metrics: Arc<RelayMetrics>,
    pub info: Arc<RwLock<StreamInfo>>,
}

struct WorkerHandle<T> {
    queue: mpsc::Sender<T>,
    stop: watch::Sender<bool>,
}

/// Per-ingest collection of output workers keyed by URL. Generic over the
/// queued item: the packet fanout carries `Packet`, the raw SRT ingest
/// fanout carries `Bytes` chunks.
pub struct OutputManager<T> {
    outputs: RwLock<HashMap<OutputUrl, WorkerHandle<T>>>,
}

impl<T: Send + 'static> OutputManager<T> {
    pub fn new() -> Self {
        Self {
            outputs: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the queue and stop signal for a new worker and hands them
    /// to `spawn`. No-op when a worker for this URL already exists.
    pub async fn add_output<F>(&self, url: &str, capacity: usize, spawn: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<T>, watch::Receiver<bool>),
    {
        let mut outputs = self.outputs.write().await;
        if outputs.contains_key(url) {
            return false;
        }
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        outputs.insert(
            url.to_string(),
            WorkerHandle {
                queue: queue_tx,
                stop: stop_tx,
            },
        );
        spawn(queue_rx, stop_rx);
        true
    }

    /// Signals the worker to stop and forgets it; the worker drains on
    /// its own.
    pub async fn remove_output(&self, url: &str) {
        let mut outputs = self.outputs.write().await;
        if let Some(handle) = outputs.remove(url) {
            let _ = handle.stop.send(true);
        }
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.outputs.read().await.contains_key(url)
    }

    /// Snapshot of the live workers for the fanout loop.
    pub async fn all_outputs(&self) -> Vec<(OutputUrl, mpsc::Sender<T>)> {
        self.outputs
            .read()
            .await
            .iter()
            .map(|(url, handle)| (url.clone(), handle.queue.clone()))
            .collect()
    }

    pub async fn urls(&self) -> Vec<OutputUrl> {
        self.outputs.read().await.keys().cloned().collect()
    }

    /// (url, queued, capacity) per worker, for the queue monitor.
    pub async fn queue_fill(&self) -> Vec<(OutputUrl, usize, usize)> {
        self.outputs
            .read()
            .await
            .iter()
            .map(|(url, handle)| {
                let capacity = handle.queue.max_capacity();
                let queued = capacity - handle.queue.capacity();
                (url.clone(), queued, capacity)
            })
            .collect()
    }

    pub async fn close_all(&self) {
        let mut outputs = self.outputs.write().await;
        for (_, handle) in outputs.drain() {
            let _ = handle.stop.send(true);
        }
    }
}

impl<T: Send + 'static> Default for OutputManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the reconnect loop for one packet-based output worker.
pub fn spawn_packet_worker(
    ctx: WorkerContext,
    queue: mpsc::Receiver<Packet>,
    stop: watch::Receiver<bool>,
) {
    tokio::spawn(run_packet_worker(ctx, queue, stop));
}

async fn run_packet_worker(
    ctx: WorkerContext,
    mut queue: mpsc::Receiver<Packet>,
    mut stop: watch::Receiver<bool>,
) {
    let scheme = match OutputScheme::of(&ctx.url) {
        Some(scheme) => scheme,
        None => {
            log::error!("Unsupported output URL scheme: {}", ctx.url);
            return;
        }
    };
    let reconnect = ctx
        .registry
        .reconnect_signal(&ctx.ingest, &ctx.url)
        .await;

    loop {
        if *stop.borrow() {
            break;
        }

        let exit = match scheme {
            OutputScheme::File => file::run(&ctx, &mut queue, &mut stop, &reconnect).await,
            OutputScheme::Rtmp => rtmp_out::run(&ctx, &mut queue, &mut stop, &reconnect).await,
            OutputScheme::Srt => srt_out::run(&ctx, &mut queue, &mut stop, &reconnect).await,
        };

        ctx.registry
            .set_output_active(&ctx.ingest, &ctx.url, false)
            .await;

        match exit {
            Ok(WorkerExit::Stopped) => break,
            Ok(WorkerExit::Reconnect) => {
                log::info!("Reconnect requested for output {}", ctx.url);
            }
            Err(err) => {
                log::warn!("Output {} failed: {:#}", ctx.url, err);
                ctx.registry
                    .increment_output_error(&ctx.ingest, &ctx.url)
                    .await;
                ctx.metrics.output_error();
            }
        }

        if !backoff(&ctx, &mut stop).await {
            break;
        }
    }

    log::info!("Output worker finished: {}", ctx.url);
}

/// Sleeps the live reconnect interval; false when stopped meanwhile.
pub(crate) async fn backoff(ctx: &WorkerContext, stop: &mut watch::Receiver<bool>) -> bool {
    let interval = ctx.registry.reconnect_interval().await;
    tokio::select! {
        _ = stop.changed() => false,
        _ = tokio::time::sleep(interval) => !*stop.borrow(),
    }
}

/// Shared select over stop / reconnect / queue used by every sink drain
/// loop.
pub(crate) enum Drained<T> {
    Stopped,
    Reconnect,
    Item(T),
    Closed,
}

pub(crate) async fn next_item<T>(
    queue: &mut mpsc::Receiver<T>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> Drained<T> {
    tokio::select! {
        _ = stop.changed() => Drained::Stopped,
        _ = reconnect.notified() => Drained::Reconnect,
        item = queue.recv() => match item {
            Some(item) => Drained::Item(item),
            None => Drained::Closed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn add_output_is_idempotent() {
        let manager: OutputManager<u32> = OutputManager::new();
        let spawned = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let spawned = spawned.clone();
            manager
                .add_output("rtmp://a/b/c", 8, move |_queue, _stop| {
                    spawned.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(manager.all_outputs().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_output_signals_stop() {
        let manager: OutputManager<u32> = OutputManager::new();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        manager
            .add_output("srt://h:1", 8, move |_queue, mut stop| {
                tokio::spawn(async move {
                    let _ = stop.changed().await;
                    let _ = seen_tx.send(*stop.borrow());
                });
            })
            .await;

        manager.remove_output("srt://h:1").await;
        assert!(seen_rx.await.unwrap());
        assert!(manager.all_outputs().await.is_empty());

        // removing again is a no-op
        manager.remove_output("srt://h:1").await;
    }

    #[tokio::test]
    async fn queue_fill_reports_depth() {
        let manager: OutputManager<u32> = OutputManager::new();
        manager.add_output("file:///tmp/x", 4, |_q, _s| {}).await;

        let outputs = manager.all_outputs().await;
        outputs[0].1.try_send(1).unwrap();
        outputs[0].1.try_send(2).unwrap();

        let fill = manager.queue_fill().await;
        assert_eq!(fill[0].1, 2);
        assert_eq!(fill[0].2, 4);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let manager: OutputManager<u32> = OutputManager::new();
        manager.add_output("file:///tmp/x", 2, |_q, _s| {}).await;

        let outputs = manager.all_outputs().await;
        outputs[0].1.try_send(1).unwrap();
        outputs[0].1.try_send(2).unwrap();
        assert!(outputs[0].1.try_send(3).is_err());
    }
}
