use tokio::sync::{mpsc, watch, Notify};

use super::{next_item, Drained, SinkResult, WorkerContext, WorkerExit};
use crate::codec::flv::{FlvFileWriter, TAG_AUDIO, TAG_VIDEO};
use crate::packet::Packet;

/// file:// sink: create/truncate the file and write an FLV container
/// until stopped. Write errors bubble up to the reconnect loop, which
/// reopens the file after backoff.
pub(super) async fn run(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Packet>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    let path = ctx.url.trim_start_matches("file://");
    let mut writer = FlvFileWriter::create(path).await?;
    log::info!("Writing FLV to file: {}", path);

    // sequence headers first so the file decodes from the top
    let info = ctx.info.read().await.clone();
    if let Some(video) = &info.video_header {
        writer.write_tag(TAG_VIDEO, 0, video).await?;
    }
    if let Some(audio) = &info.audio_header {
        writer.write_tag(TAG_AUDIO, 0, audio).await?;
    }

    ctx.registry
        .set_output_active(&ctx.ingest, &ctx.url, true)
        .await;
    ctx.metrics.output_connected();

    loop {
        match next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                writer.finish().await?;
                log::info!("File output stopped: {}", path);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => {
                writer.finish().await?;
                return Ok(WorkerExit::Reconnect);
            }
            Drained::Item(packet) => {
                let len = packet.payload.len() as u64;
                writer.write_packet(&packet).await?;
                ctx.metrics.wrote_bytes(len);
                ctx.registry
                    .update_output_bitrate(&ctx.ingest, &ctx.url, writer.bytes_written())
                    .await;
            }
        }
    }
}
