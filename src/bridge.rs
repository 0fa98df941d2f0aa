//! SRT→RTMP bridge: demuxes the raw transport stream of an SRT ingest
//! and remuxes it onto an RTMP connection. Timestamps are rebased on the
//! first video keyframe so downstream players start clean.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};

use crate::codec::aac::{self, AdtsHeader};
use crate::codec::avc::{self, DecoderConfigurationRecord};
use crate::mpegts::{PesPacket, TsDemuxer, STREAM_TYPE_AAC_ADTS, STREAM_TYPE_H264};
use crate::output::{Drained, SinkResult, WorkerContext, WorkerExit};
use crate::rtmp::RtmpClient;

/// Remux state for one bridged output connection.
struct BridgeState {
    demuxer: TsDemuxer,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    dcr: Option<DecoderConfigurationRecord>,
    asc: Option<[u8; 2]>,
    header_written: bool,
    base_time: Option<Duration>,
    last_video: Duration,
    last_audio: Duration,
    total_bytes: u64,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            demuxer: TsDemuxer::new(),
            video_pid: None,
            audio_pid: None,
            dcr: None,
            asc: None,
            header_written: false,
            base_time: None,
            last_video: Duration::ZERO,
            last_audio: Duration::ZERO,
            total_bytes: 0,
        }
    }
}

pub(crate) async fn run(
    ctx: &WorkerContext,
    queue: &mut mpsc::Receiver<Bytes>,
    stop: &mut watch::Receiver<bool>,
    reconnect: &Notify,
) -> SinkResult {
    let dial_timeout = connect_timeout(ctx).await;
    let mut client = RtmpClient::connect(&ctx.url, dial_timeout).await?;
    log::info!("Bridging SRT ingest {} to RTMP output {}", ctx.ingest, ctx.url);

    let mut state = BridgeState::new();

    loop {
        client.drain_input().await?;

        match crate::output::next_item(queue, stop, reconnect).await {
            Drained::Stopped | Drained::Closed => {
                log::info!("RTMP bridge stopped: {}", ctx.url);
                return Ok(WorkerExit::Stopped);
            }
            Drained::Reconnect => return Ok(WorkerExit::Reconnect),
            Drained::Item(chunk) => {
                let packets = state.demuxer.push(&chunk);
                for pes in packets {
                    handle_pes(ctx, &mut client, &mut state, pes).await?;
                }
            }
        }
    }
}

async fn handle_pes(
    ctx: &WorkerContext,
    client: &mut RtmpClient,
    state: &mut BridgeState,
    pes: PesPacket,
) -> anyhow::Result<()> {
    detect_pids(state, &pes);

    let is_video = state.video_pid == Some(pes.pid);
    let is_audio = state.audio_pid == Some(pes.pid);
    if !is_video && !is_audio {
        return Ok(());
    }

    if !state.header_written {
        collect_codec_data(state, &pes, is_video);
        if let (Some(dcr), Some(asc)) = (&state.dcr, &state.asc) {
            // both codecs known: publish sequence headers and go live
            let mut video_tag = vec![0x17, 0x00, 0x00, 0x00, 0x00];
            video_tag.extend_from_slice(&dcr.to_bytes()?);
            client.publish_video(video_tag.into(), 0).await?;

            let mut audio_tag = vec![0xAF, 0x00];
            audio_tag.extend_from_slice(asc);
            client.publish_audio(audio_tag.into(), 0).await?;

            state.header_written = true;
            ctx.registry
                .set_output_active(&ctx.ingest, &ctx.url, true)
                .await;
            ctx.metrics.output_connected();
            log::info!("RTMP bridge header written for {}", ctx.url);
        }
        if !state.header_written {
            return Ok(());
        }
    }

    let keyframe = is_video && avc::contains_idr(&pes.data);

    // everything before the first keyframe is dropped; its PTS becomes
    // the base for the whole bridged timeline
    let pts = match pes.pts {
        Some(pts) => Duration::from_millis(pts / 90),
        None => return Ok(()),
    };
    let base = match state.base_time {
        Some(base) => base,
        None => {
            if !keyframe {
                return Ok(());
            }
            log::info!("RTMP bridge base time set: {:?}", pts);
            state.base_time = Some(pts);
            pts
        }
    };
    let mut time = pts.saturating_sub(base);

    if is_video {
        if time < state.last_video {
            time = state.last_video + Duration::from_millis(1);
        }
        state.last_video = time;

        let avcc = avc::annexb_to_avcc(&pes.data);
        if avcc.is_empty() {
            return Ok(());
        }
        let mut tag = Vec::with_capacity(5 + avcc.len());
        tag.push(if keyframe { 0x17 } else { 0x27 });
        tag.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        tag.extend_from_slice(&avcc);

        let len = tag.len() as u64;
        client
            .publish_video(Bytes::from(tag), time.as_millis() as u32)
            .await?;
        state.total_bytes += len;
    } else {
        if time < state.last_audio {
            time = state.last_audio + Duration::from_millis(1);
        }
        state.last_audio = time;

        // strip the ADTS framing, RTMP carries raw AAC
        let header = match AdtsHeader::parse(&pes.data) {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        if pes.data.len() <= header.header_len {
            return Ok(());
        }
        let raw = &pes.data[header.header_len..];
        let mut tag = Vec::with_capacity(2 + raw.len());
        tag.extend_from_slice(&[0xAF, 0x01]);
        tag.extend_from_slice(raw);

        let len = tag.len() as u64;
        client
            .publish_audio(Bytes::from(tag), time.as_millis() as u32)
            .await?;
        state.total_bytes += len;
    }

    ctx.metrics.wrote_bytes(pes.data.len() as u64);
    ctx.registry
        .update_output_bitrate(&ctx.ingest, &ctx.url, state.total_bytes)
        .await;
    Ok(())
}

/// PID detection: PMT stream types first, then payload heuristics (NAL
/// start code for H.264, ADTS syncword for AAC).
fn detect_pids(state: &mut BridgeState, pes: &PesPacket) {
    if state.video_pid.is_none() && pes.stream_type == Some(STREAM_TYPE_H264) {
        state.video_pid = Some(pes.pid);
    }
    if state.audio_pid.is_none() && pes.stream_type == Some(STREAM_TYPE_AAC_ADTS) {
        state.audio_pid = Some(pes.pid);
    }

    if state.video_pid.is_none() && looks_like_h264(&pes.data) {
        state.video_pid = Some(pes.pid);
    } else if state.audio_pid.is_none()
        && state.video_pid != Some(pes.pid)
        && aac::is_adts(&pes.data)
    {
        state.audio_pid = Some(pes.pid);
    }
}

fn looks_like_h264(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }
    let nal = if data[..4] == [0, 0, 0, 1] {
        data[4] & 0x1F
    } else if data[..3] == [0, 0, 1] {
        data[3] & 0x1F
    } else {
        return false;
    };
    (1..=12).contains(&nal)
}

fn collect_codec_data(state: &mut BridgeState, pes: &PesPacket, is_video: bool) {
    if is_video && state.dcr.is_none() {
        let mut sps: Option<Vec<u8>> = None;
        let mut pps: Option<Vec<u8>> = None;
        for nalu in avc::split_annexb(&pes.data) {
            match avc::nal_type(nalu) {
                avc::NAL_SPS => sps = Some(nalu.to_vec()),
                avc::NAL_PPS => pps = Some(nalu.to_vec()),
                _ => {}
            }
        }
        if let (Some(sps), Some(pps)) = (sps, pps) {
            match DecoderConfigurationRecord::from_sps_pps(sps, pps) {
                Ok(dcr) => state.dcr = Some(dcr),
                Err(err) => log::debug!("Bad SPS/PPS in bridge stream: {}", err),
            }
        }
    } else if !is_video && state.asc.is_none() {
        if let Ok(header) = AdtsHeader::parse(&pes.data) {
            state.asc = Some(header.audio_specific_config());
        }
    }
}

async fn connect_timeout(ctx: &WorkerContext) -> Duration {
    let ms = ctx.registry.srt_settings().await.connect_timeout;
    if ms > 0 {
        Duration::from_millis(ms)
    } else {
        Duration::from_secs(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::{TsMuxer, VIDEO_PID};
    use bytes::BytesMut;

    fn keyframe_annexb() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x80]);
        v
    }

    #[test]
    fn pid_detection_via_pmt_and_heuristics() {
        let mut state = BridgeState::new();

        // with PMT info
        state.video_pid = None;
        detect_pids(
            &mut state,
            &PesPacket {
                pid: 0x100,
                stream_type: Some(STREAM_TYPE_H264),
                pts: Some(0),
                data: Bytes::new(),
            },
        );
        assert_eq!(state.video_pid, Some(0x100));

        // without PMT info: syncword heuristics
        let mut state = BridgeState::new();
        detect_pids(
            &mut state,
            &PesPacket {
                pid: 0x200,
                stream_type: None,
                pts: Some(0),
                data: Bytes::from(keyframe_annexb()),
            },
        );
        assert_eq!(state.video_pid, Some(0x200));

        detect_pids(
            &mut state,
            &PesPacket {
                pid: 0x201,
                stream_type: None,
                pts: Some(0),
                data: Bytes::from_static(&[0xFF, 0xF1, 0x50, 0x80, 0x01, 0x3F, 0xFC]),
            },
        );
        assert_eq!(state.audio_pid, Some(0x201));
    }

    #[test]
    fn codec_data_extraction() {
        let mut state = BridgeState::new();
        state.video_pid = Some(VIDEO_PID);
        let pes = PesPacket {
            pid: VIDEO_PID,
            stream_type: Some(STREAM_TYPE_H264),
            pts: Some(90_000),
            data: Bytes::from(keyframe_annexb()),
        };
        collect_codec_data(&mut state, &pes, true);
        let dcr = state.dcr.expect("sps/pps should build a DCR");
        assert_eq!(dcr.sps[0][0] & 0x1F, avc::NAL_SPS);
        assert_eq!(dcr.pps[0][0] & 0x1F, avc::NAL_PPS);
    }

    #[test]
    fn bridge_recovers_codec_data_from_muxed_ts() {
        // run a muxed stream through the demuxer the way the bridge does
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.write_video(&mut out, 450_000, 450_000, true, &keyframe_annexb());
        muxer.write_audio(
            &mut out,
            451_000,
            &AdtsWrap::frame(&[0x21, 0x10, 0x04, 0x60, 0x8C, 0x1C]),
        );
        muxer.write_video(&mut out, 453_000, 453_000, false, &[0, 0, 0, 1, 0x41, 0x9A]);

        let mut state = BridgeState::new();
        let mut packets = state.demuxer.push(&out);
        packets.extend(state.demuxer.flush());

        for pes in packets {
            detect_pids(&mut state, &pes);
            let is_video = state.video_pid == Some(pes.pid);
            collect_codec_data(&mut state, &pes, is_video);
        }
        assert!(state.dcr.is_some());
        assert!(state.asc.is_some());
    }

    struct AdtsWrap;
    impl AdtsWrap {
        fn frame(raw: &[u8]) -> Vec<u8> {
            crate::codec::aac::AudioSpecificConfig {
                object_type: 2,
                sampling_frequency_index: 4,
                channel_configuration: 2,
            }
            .adts_wrap(raw)
        }
    }

    #[test]
    fn h264_heuristic_bounds() {
        assert!(looks_like_h264(&[0, 0, 0, 1, 0x65, 0x00]));
        assert!(looks_like_h264(&[0, 0, 1, 0x41, 0x00]));
        assert!(!looks_like_h264(&[0xFF, 0xF1, 0x50, 0x80, 0x01]));
        assert!(!looks_like_h264(&[0, 0, 0, 1, 0x0D, 0x00]));
    }
}
