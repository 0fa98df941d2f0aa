//! WHIP ingest: `POST /whip/<name>` with an SDP offer creates a WebRTC
//! peer connection whose H.264 track is depacketized in-process and fed
//! into the standard packet fanout. Audio tracks are drained and skipped
//! (re-encoding Opus is out of scope for a forwarding relay).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::avc::{self, DecoderConfigurationRecord};
use crate::metrics::RelayMetrics;
use crate::packet::{Packet, StreamInfo};
use crate::registry::Registry;
use crate::session::IngestSession;

pub struct Service {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    sessions: Arc<Mutex<HashMap<String, Arc<RTCPeerConnection>>>>,
}

impl Service {
    pub fn new(registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry,
            metrics,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self, port: u16, mut shutdown: watch::Receiver<bool>) {
        let service = Arc::new(self);
        let make_service = make_service_fn(move |_| {
            let service = service.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let service = service.clone();
                    async move { Ok::<_, Infallible>(service.handle(req).await) }
                }))
            }
        });

        let addr = match format!("[::]:{}", port).parse() {
            Ok(addr) => addr,
            Err(err) => {
                log::error!("Invalid WHIP listen address: {}", err);
                return;
            }
        };
        let server = Server::bind(&addr)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
        log::info!("WHIP endpoint listening on http://{}/whip/<name>", addr);
        if let Err(err) = server.await {
            log::error!("WHIP server error: {}", err);
        }
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.method() != Method::POST {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }
        let path = req.uri().path().to_string();
        let name = match path.strip_prefix("/whip/") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return plain(StatusCode::BAD_REQUEST, "Missing stream name in URL"),
        };

        let cfg = match self.registry.ingest_by_path(&path).await {
            Some(cfg) => cfg,
            None => return plain(StatusCode::NOT_FOUND, "Ingest not found"),
        };

        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(_) => return plain(StatusCode::BAD_REQUEST, "Failed to read body"),
        };
        let offer_sdp = extract_offer(&body);
        if offer_sdp.is_empty() {
            return plain(StatusCode::BAD_REQUEST, "Empty SDP offer");
        }

        match self.accept_publisher(&cfg.name, offer_sdp).await {
            Ok(answer) => {
                log::info!("WHIP SDP answer sent for ingest '{}' ({})", cfg.name, name);
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Location", path)
                    .header("Content-Type", "application/sdp")
                    .body(Body::from(answer))
                    .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "response"))
            }
            Err(err) => {
                log::error!("WHIP negotiation failed for {}: {:#}", cfg.name, err);
                plain(StatusCode::INTERNAL_SERVER_ERROR, "WebRTC negotiation failed")
            }
        }
    }

    async fn accept_publisher(
        &self,
        name: &str,
        offer_sdp: String,
    ) -> anyhow::Result<String> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let interceptors =
            register_default_interceptors(InterceptorRegistry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await?,
        );

        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let info = Arc::new(RwLock::new(StreamInfo::default()));
        let session = IngestSession::new(
            name.to_string(),
            self.registry.clone(),
            self.metrics.clone(),
            info.clone(),
            source_rx,
        );
        tokio::spawn(session.run());

        {
            let info = info.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let source_tx = source_tx.clone();
                let info = info.clone();
                Box::pin(async move {
                    match track.kind() {
                        RTPCodecType::Video => {
                            log::info!("WHIP video track arrived: {}", track.id());
                            tokio::spawn(read_video_track(track, source_tx, info));
                        }
                        _ => {
                            log::info!(
                                "WHIP audio track arrived: {} (skipped, no transcoding)",
                                track.id()
                            );
                            tokio::spawn(drain_track(track));
                        }
                    }
                })
            }));
        }

        {
            let sessions = self.sessions.clone();
            let name = name.to_string();
            let weak_pc = Arc::downgrade(&pc);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sessions = sessions.clone();
                let name = name.clone();
                let weak_pc = weak_pc.clone();
                Box::pin(async move {
                    log::info!("WHIP connection state for {}: {}", name, state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Closed
                            | RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                    ) {
                        sessions.lock().await.remove(&name);
                        if let Some(pc) = weak_pc.upgrade() {
                            let _ = pc.close().await;
                        }
                    }
                })
            }));
        }

        let offer = RTCSessionDescription::offer(offer_sdp)?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        let _ = gather_complete.recv().await;

        let answer_sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| anyhow::anyhow!("no local description after gathering"))?;

        // one publisher per ingest; a newcomer replaces the old session
        if let Some(previous) = self
            .sessions
            .lock()
            .await
            .insert(name.to_string(), pc.clone())
        {
            let _ = previous.close().await;
        }

        Ok(answer_sdp)
    }

    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, pc) in sessions.drain() {
            let _ = pc.close().await;
        }
    }
}

fn extract_offer(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body).to_string();
    if text.trim_start().starts_with("{\"type\":") {
        #[derive(serde::Deserialize)]
        struct JsonOffer {
            sdp: String,
        }
        if let Ok(offer) = serde_json::from_str::<JsonOffer>(&text) {
            return offer.sdp;
        }
    }
    text
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap_or_default()
}

/// Reads one H.264 RTP track, assembles access units on marker bits, and
/// forwards them as FLV-framed packets.
async fn read_video_track(
    track: Arc<TrackRemote>,
    source: mpsc::UnboundedSender<Packet>,
    info: Arc<RwLock<StreamInfo>>,
) {
    let mut depacketizer = H264Packet::default();
    let mut access_unit: Vec<u8> = Vec::new();
    let mut base_ts: Option<u32> = None;
    let mut have_dcr = false;

    loop {
        let (pkt, _attrs) = match track.read_rtp().await {
            Ok(pkt) => pkt,
            Err(err) => {
                log::info!("WHIP video track ended: {}", err);
                return;
            }
        };
        if pkt.payload.is_empty() {
            continue;
        }

        match depacketizer.depacketize(&pkt.payload) {
            Ok(data) => access_unit.extend_from_slice(&data),
            Err(err) => {
                log::debug!("RTP depacketize error: {}", err);
                continue;
            }
        }
        if !pkt.header.marker {
            continue;
        }

        let annexb = std::mem::take(&mut access_unit);
        if annexb.is_empty() {
            continue;
        }

        let base = *base_ts.get_or_insert(pkt.header.timestamp);
        let time_ms = (pkt.header.timestamp.wrapping_sub(base) / 90) as u64;

        if !have_dcr {
            if let Some(dcr) = dcr_from_annexb(&annexb) {
                match dcr.to_bytes() {
                    Ok(body) => {
                        let mut tag = vec![0x17, 0x00, 0x00, 0x00, 0x00];
                        tag.extend_from_slice(&body);
                        info.write().await.video_header = Some(Bytes::from(tag));
                        have_dcr = true;
                    }
                    Err(err) => log::debug!("DCR serialization failed: {}", err),
                }
            }
        }

        let keyframe = avc::contains_idr(&annexb);
        let avcc = avc::annexb_to_avcc(&annexb);
        if avcc.is_empty() {
            continue;
        }
        let mut tag = Vec::with_capacity(5 + avcc.len());
        tag.push(if keyframe { 0x17 } else { 0x27 });
        tag.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        tag.extend_from_slice(&avcc);

        if source.send(Packet::video(time_ms, 0, keyframe, tag)).is_err() {
            return;
        }
    }
}

async fn drain_track(track: Arc<TrackRemote>) {
    while track.read_rtp().await.is_ok() {}
}

fn dcr_from_annexb(annexb: &[u8]) -> Option<DecoderConfigurationRecord> {
    let mut sps = None;
    let mut pps = None;
    for nalu in avc::split_annexb(annexb) {
        match avc::nal_type(nalu) {
            avc::NAL_SPS => sps = Some(nalu.to_vec()),
            avc::NAL_PPS => pps = Some(nalu.to_vec()),
            _ => {}
        }
    }
    DecoderConfigurationRecord::from_sps_pps(sps?, pps?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_extraction_handles_json_and_raw() {
        let raw = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n";
        assert_eq!(extract_offer(raw), String::from_utf8_lossy(raw));

        let json = br#"{"type":"offer","sdp":"v=0\r\n"}"#;
        assert_eq!(extract_offer(json), "v=0\r\n");
    }

    #[test]
    fn dcr_extraction_from_access_unit() {
        let mut annexb = Vec::new();
        annexb.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F]);
        annexb.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        annexb.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);
        assert!(dcr_from_annexb(&annexb).is_some());

        let no_params = [0u8, 0, 0, 1, 0x41, 0x9A];
        assert!(dcr_from_annexb(&no_params).is_none());
    }
}
