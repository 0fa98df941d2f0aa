use std::convert::TryFrom;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use srt_tokio::SrtSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;

use super::{next_item, Drained, SinkResult, WorkerContext, WorkerExit};
use crate::codec::aac::AudioSpecificConfig;
use crate::codec::avc::{self, DecoderConfigurationRecord};
use crate::codec::flv::{AudioData, VideoData};
use crate::mpegts::TsMuxer;
use crate::packet::{Packet, PacketKind};
use crate::srt_target;
use crate::timing::TimingNormalizer;

/// Per-write deadline on the SRT connection.
const WRITE_DEADLINE: Duration = Duration::from_secs(2);
/// Hard ceiling for flushing one muxed buffer.
const FLUSH_DEADLINE: Duration = Duration::from_secs(3);
/// 7 TS cells per SRT payload, the conventional TS-over-SRT chunk.
const SRT_CHUNK: usize = 1316;

/// srt:// sink: normalize timestamps, remux to MPEG-TS, and push the
/// buffer out chunkwise under write deadlines. Packets ahead of the
/// first video keyframe are dropped to pin the reference timeline.
pub(super) async fn run(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Packet>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    let mut socket = dial(ctx).await?;
    ctx.registry
        .set_output_active(&ctx.ingest, &ctx.url, true)
        .await;
    ctx.metrics.output_connected();

    let info = ctx.info.read().await.clone();
    let dcr = info
        .video_header
        .as_deref()
        .and_then(|tag| VideoData::try_from(tag).ok())
        .and_then(|tag| DecoderConfigurationRecord::parse(&tag.body).ok());
    let asc = info
        .audio_header
        .as_deref()
        .and_then(|tag| AudioData::try_from(tag).ok())
        .and_then(|tag| AudioSpecificConfig::parse(&tag.body).ok());

    let mut muxer = TsMuxer::new();
    let mut buf = BytesMut::new();
    let mut total_bytes: u64 = 0;

    // tables go out ahead of the first media packet
    muxer.write_tables(&mut buf);
    flush(&mut socket, &mut buf, &mut total_bytes).await?;
    ctx.registry
        .update_output_bitrate(&ctx.ingest, &ctx.url, total_bytes)
        .await;

    let mut normalizer = TimingNormalizer::new();
    let mut seen_keyframe = false;

    loop {
        match next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                log::info!("SRT output stopped: {}", ctx.url);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => return Ok(WorkerExit::Reconnect),
            Drained::Item(mut packet) => {
                if !seen_keyframe {
                    if packet.kind == PacketKind::Video && packet.keyframe {
                        seen_keyframe = true;
                    } else {
                        continue;
                    }
                }

                normalizer.process(&mut packet);
                if !mux_packet(&mut muxer, &mut buf, &packet, dcr.as_ref(), asc.as_ref()) {
                    continue;
                }

                if !buf.is_empty() {
                    flush(&mut socket, &mut buf, &mut total_bytes).await?;
                    ctx.registry
                        .update_output_bitrate(&ctx.ingest, &ctx.url, total_bytes)
                        .await;
                }
            }
        }
    }
}

async fn dial(ctx: &WorkerContext) -> anyhow::Result<SrtSocket> {
    let srt = ctx.registry.srt_settings().await;
    let addr = srt_target(&ctx.url).to_string();

    let mut builder = SrtSocket::builder();
    if srt.latency > 0 {
        builder = builder.latency(Duration::from_millis(srt.latency));
    }
    if !srt.passphrase.is_empty() {
        // key size 0 lets the library negotiate
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

    log::info!(
        "SRT connecting to {} with latency={}ms streamid={:?} timeout={:?}",
        addr,
        srt.latency,
        stream_id,
        connect_timeout
    );
    let socket = timeout(connect_timeout, builder.call(addr.as_str(), stream_id))
        .await
        .context("srt dial timeout")??;
    Ok(socket)
}

/// Remuxes one normalized packet; false when it had to be skipped.
fn mux_packet(
    muxer: &mut TsMuxer,
    buf: &mut BytesMut,
    packet: &Packet,
    dcr: Option<&DecoderConfigurationRecord>,
    asc: Option<&AudioSpecificConfig>,
) -> bool {
    match packet.kind {
        PacketKind::Video => {
            let tag = match VideoData::try_from(packet.payload.as_ref()) {
                Ok(tag) => tag,
                Err(_) => return false,
            };
            let nalu_size = dcr.map(|d| d.nalu_size).unwrap_or(4);
            let mut annexb = match avc::avcc_to_annexb(&tag.body, nalu_size) {
                Ok(annexb) => annexb,
                Err(err) => {
                    log::debug!("Dropping video packet with bad AVCC body: {}", err);
                    return false;
                }
            };
            if packet.keyframe {
                if let Some(dcr) = dcr {
                    let mut prefixed = dcr.parameter_sets_annexb();
                    prefixed.extend_from_slice(&annexb);
                    annexb = prefixed;
                }
            }

            let dts = packet.time.as_millis() as u64 * 90;
            let pts = dts + packet.composition_time.as_millis() as u64 * 90;
            muxer.write_video(buf, pts, dts, packet.keyframe, &annexb);
            true
        }
        PacketKind::Audio => {
            let tag = match AudioData::try_from(packet.payload.as_ref()) {
                Ok(tag) if tag.is_aac => tag,
                _ => return false,
            };
            let asc = match asc {
                Some(asc) => asc,
                // no AudioSpecificConfig seen yet, cannot frame ADTS
                None => return false,
            };
            let adts = asc.adts_wrap(&tag.body);
            let pts = packet.time.as_millis() as u64 * 90;
            muxer.write_audio(buf, pts, &adts);
            true
        }
    }
}

/// Writes the muxed buffer chunkwise with per-write and total deadlines.
async fn flush(
    socket: &mut SrtSocket,
    buf: &mut BytesMut,
    total_bytes: &mut u64,
) -> anyhow::Result<()> {
    let data = buf.split().freeze();
    if data.is_empty() {
        return Ok(());
    }

    let flush_all = async {
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + SRT_CHUNK).min(data.len());
            let chunk: Bytes = data.slice(offset..end);
            let write = socket.send((std::time::Instant::now(), chunk));
            match timeout(WRITE_DEADLINE, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => bail!("srt write error: {}", e),
                Err(_) => bail!("srt write deadline exceeded"),
            }
            offset = end;
        }
        Ok::<(), anyhow::Error>(())
    };

    match timeout(FLUSH_DEADLINE, flush_all).await {
        Ok(Ok(())) => {
            *total_bytes += data.len() as u64;
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("srt flush deadline exceeded, forcing reconnect"),
    }
}
