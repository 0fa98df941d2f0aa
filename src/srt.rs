use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::StreamExt;
use srt_tokio::{SrtListener, SrtSocket};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

use crate::bridge;
use crate::metrics::RelayMetrics;
use crate::output::{backoff, next_item, Drained, OutputManager, SinkResult, WorkerContext, WorkerExit};
use crate::packet::StreamInfo;
use crate::registry::Registry;
use crate::{srt_target, IngestName, OutputScheme};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Per-write deadline for raw chunk forwarding.
const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// SRT ingest listener. The publisher's streamId names the ingest; an
/// empty streamId falls back to the configured default. Unknown names
/// are rejected at accept time. The ingress is raw MPEG-TS, fanned out
/// chunkwise; rtmp outputs go through the demux bridge.
pub struct Service {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
}

impl Service {
    pub fn new(registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub async fn run(self, port: u16, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.listen(port, &mut shutdown).await {
            log::error!("SRT listener error: {:#}", err);
        }
    }

    async fn listen(&self, port: u16, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let (_listener, mut incoming) = SrtListener::builder()
            .bind(addr)
            .await
            .context("srt listener bind")?;
        log::info!("Listening for SRT connections on {}", addr);

        let incoming = incoming.incoming();
        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("SRT listener shutting down");
                    return Ok(());
                }
                request = incoming.next() => match request {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            let stream_id = request.stream_id().map(|s| s.to_string());
            let name = match self.resolve_name(stream_id.as_deref()).await {
                Some(name) => name,
                None => {
                    log::warn!(
                        "Rejecting SRT publisher with unknown streamid {:?}",
                        stream_id
                    );
                    continue;
                }
            };

            let socket = match request.accept(None).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::error!("Failed to accept SRT connection: {}", err);
                    continue;
                }
            };
            log::info!("SRT publisher connected for ingest {}", name);

            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                handle_ingest(socket, name, registry, metrics, shutdown).await;
            });
        }
    }

    /// streamId → ingest name; empty falls back to the configured
    /// default. Returns None when no such ingest is declared.
    async fn resolve_name(&self, stream_id: Option<&str>) -> Option<IngestName> {
        let name = match stream_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let fallback = self.registry.srt_settings().await.streamid;
                if fallback.is_empty() {
                    return None;
                }
                fallback
            }
        };
        self.registry.ingest_by_name(&name).await.map(|cfg| cfg.name)
    }
}

async fn handle_ingest(
    mut socket: SrtSocket,
    name: IngestName,
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    registry.set_ingest_active(&name, true).await;
    metrics.session_started();

    let manager: Arc<OutputManager<Bytes>> = Arc::new(OutputManager::new());
    let capacity = registry.queue_capacity().await;
    let info = Arc::new(RwLock::new(StreamInfo::default()));

    for url in registry.output_urls(&name).await {
        start_chunk_worker(&manager, &registry, &metrics, &info, &name, &url, capacity).await;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = tokio::spawn(reconcile_chunks(
        manager.clone(),
        registry.clone(),
        metrics.clone(),
        info.clone(),
        name.clone(),
        capacity,
        stop_rx,
    ));

    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = socket.next() => item,
        };
        match item {
            Some(Ok((_, data))) => {
                metrics.forwarded(1);
                for (url, queue) in manager.all_outputs().await {
                    match queue.try_send(data.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            metrics.dropped(1);
                            log::warn!("Output queue full for {}, dropping chunk", url);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
            Some(Err(err)) => {
                log::warn!("SRT read error on ingest {}: {}", name, err);
                break;
            }
            None => {
                log::info!("SRT publisher for {} disconnected", name);
                break;
            }
        }
    }

    let _ = stop_tx.send(true);
    let _ = reconciler.await;
    manager.close_all().await;

    for url in registry.output_urls(&name).await {
        registry.set_output_active(&name, &url, false).await;
    }
    registry.set_ingest_active(&name, false).await;
    metrics.session_finished();
}

async fn start_chunk_worker(
    manager: &OutputManager<Bytes>,
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
            tokio::spawn(run_chunk_worker(ctx, queue, stop));
        })
        .await;
}

async fn reconcile_chunks(
    manager: Arc<OutputManager<Bytes>>,
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
                    start_chunk_worker(&manager, &registry, &metrics, &info, &name, url, capacity).await;
                }
                for url in manager.urls().await {
                    if !declared.contains(&url) {
                        manager.remove_output(&url).await;
                    }
                }
            }
            _ = monitor.tick() => {
                let fills = manager.queue_fill().await;
                log::info!("SRT ingest {} up {:?}, {} outputs", name, started.elapsed(), fills.len());
                for (url, queued, cap) in fills {
                    let percent = queued * 100 / cap.max(1);
                    if percent > 75 {
                        log::warn!("Output queue for {} is {}% full: {}/{}", url, percent, queued, cap);
                    } else if percent > 50 {
                        log::warn!("Output queue for {} filling up: {}/{}", url, queued, cap);
                    }
                }
            }
        }
    }
}

/// Reconnect loop for one raw-chunk worker; mirrors the packet worker.
async fn run_chunk_worker(
    ctx: WorkerContext,
    mut queue: mpsc::Receiver<Bytes>,
    mut stop: watch::Receiver<bool>,
) {
    let scheme = match OutputScheme::of(&ctx.url) {
        Some(scheme) => scheme,
        None => return,
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
            OutputScheme::Srt => run_srt_chunks(&ctx, &mut queue, &mut stop, &reconnect).await,
            OutputScheme::File => run_file_chunks(&ctx, &mut queue, &mut stop, &reconnect).await,
            OutputScheme::Rtmp => bridge::run(&ctx, &mut queue, &mut stop, &reconnect).await,
        };

        ctx.registry
            .set_output_active(&ctx.ingest, &ctx.url, false)
            .await;

        match exit {
            Ok(WorkerExit::Stopped) => break,
            Ok(WorkerExit::Reconnect) => {}
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

/// srt:// chunk sink: forward the transport stream verbatim.
async fn run_srt_chunks(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Bytes>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    let srt = ctx.registry.srt_settings().await;
    let addr = srt_target(&ctx.url).to_string();

    let mut builder = SrtSocket::builder();
    if srt.latency > 0 {
        builder = builder.latency(Duration::from_millis(srt.latency));
    }
    if !srt.passphrase.is_empty() {
        builder = builder.encryption(0, &srt.passphrase);
    }
    let stream_id = if srt.streamid.is_empty() {
        None
    } else {
        Some(srt.streamid.as_str())
    };
    let connect_timeout = if srt.connect_timeout > 0 {
        Duration::from_millis(srt.connect_timeout)
    } else {
        Duration::from_secs(3)
    };

    let mut socket = timeout(connect_timeout, builder.call(addr.as_str(), stream_id))
        .await
        .context("srt dial timeout")??;
    log::info!("Connected to SRT output: {}", ctx.url);
    ctx.registry
        .set_output_active(&ctx.ingest, &ctx.url, true)
        .await;
    ctx.metrics.output_connected();

    let mut total_bytes: u64 = 0;
    loop {
        match next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                log::info!("SRT output stopped: {}", ctx.url);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => return Ok(WorkerExit::Reconnect),
            Drained::Item(data) => {
                use futures::SinkExt;
                let len = data.len() as u64;
                let write = socket.send((std::time::Instant::now(), data));
                match timeout(WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => anyhow::bail!("srt write error: {}", e),
                    Err(_) => anyhow::bail!("srt write deadline exceeded"),
                }
                total_bytes += len;
                ctx.metrics.wrote_bytes(len);
                ctx.registry
                    .update_output_bitrate(&ctx.ingest, &ctx.url, total_bytes)
                    .await;
            }
        }
    }
}

/// file:// chunk sink: the raw transport stream straight to disk.
async fn run_file_chunks(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Bytes>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    use tokio::io::AsyncWriteExt;

    let path = ctx.url.trim_start_matches("file://");
    let mut file = tokio::fs::File::create(path).await?;
    log::info!("Writing transport stream to file: {}", path);
    ctx.registry
        .set_output_active(&ctx.ingest, &ctx.url, true)
        .await;
    ctx.metrics.output_connected();

    let mut total_bytes: u64 = 0;
    loop {
        match next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                file.flush().await?;
                log::info!("File output stopped: {}", path);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => {
                file.flush().await?;
                return Ok(WorkerExit::Reconnect);
            }
            Drained::Item(data) => {
                file.write_all(&data).await?;
                total_bytes += data.len() as u64;
                ctx.metrics.wrote_bytes(data.len() as u64);
                ctx.registry
                    .update_output_bitrate(&ctx.ingest, &ctx.url, total_bytes)
                    .await;
            }
        }
    }
}
