use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};

use super::{next_item, Drained, SinkResult, WorkerContext, WorkerExit};
use crate::packet::{Packet, PacketKind};
use crate::rtmp::RtmpClient;

/// rtmp:// sink: dial, publish metadata and codec headers, then forward
/// tag payloads as they drain from the queue.
pub(super) async fn run(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Packet>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    let dial_timeout = dial_timeout(ctx).await;
    let mut client = RtmpClient::connect(&ctx.url, dial_timeout).await?;

    let info = ctx.info.read().await.clone();
    if let Some(metadata) = &info.metadata {
        client.publish_metadata(metadata).await?;
    }
    if let Some(video) = &info.video_header {
        client.publish_video(video.clone(), 0).await?;
    }
    if let Some(audio) = &info.audio_header {
        client.publish_audio(audio.clone(), 0).await?;
    }

    ctx.registry
        .set_output_active(&ctx.ingest, &ctx.url, true)
        .await;
    ctx.metrics.output_connected();

    let mut total_bytes: u64 = 0;
    loop {
        client.drain_input().await?;

        match next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                log::info!("RTMP output stopped: {}", ctx.url);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => return Ok(WorkerExit::Reconnect),
            Drained::Item(packet) => {
                let len = packet.payload.len() as u64;
                let timestamp = packet.time_ms() as u32;
                match packet.kind {
                    PacketKind::Video => client.publish_video(packet.payload, timestamp).await?,
                    PacketKind::Audio => client.publish_audio(packet.payload, timestamp).await?,
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

pub(crate) async fn dial_timeout(ctx: &WorkerContext) -> Duration {
    let ms = ctx.registry.srt_settings().await.connect_timeout;
    if ms > 0 {
        Duration::from_millis(ms)
    } else {
        Duration::from_secs(3)
    }
}
