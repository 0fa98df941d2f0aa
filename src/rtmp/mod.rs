mod client;
mod proto;

pub use client::{RtmpClient, RtmpTarget};
pub use proto::{Event, Protocol};

use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, Framed};

use crate::codec::flv::{AudioData, VideoData};
use crate::error::Error as PError;
use crate::metrics::RelayMetrics;
use crate::packet::{Packet, StreamInfo};
use crate::registry::Registry;
use crate::session::IngestSession;

const TIME_OUT: Duration = Duration::from_secs(5);

/// RTMP ingest listener: accepts publishers and feeds each one into an
/// ingest session. Play requests are accepted and immediately closed.
pub struct Service {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    client_id: u64,
}

impl Service {
    pub fn new(registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry,
            metrics,
            client_id: 0,
        }
    }

    pub async fn run(mut self, port: u16, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.listen(port, &mut shutdown).await {
            log::error!("RTMP listener error: {}", err);
        }
    }

    async fn listen(&mut self, port: u16, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let addr = format!("[::]:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("Listening for RTMP connections on {}", addr);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("RTMP listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (tcp_stream, _addr) = accepted?;
                    tcp_stream.set_nodelay(true).ok();
                    self.process(tcp_stream);
                    self.client_id += 1;
                }
            }
        }
    }

    fn process<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        log::info!("New RTMP client connection: {}", self.client_id);
        let conn = Connection::new(
            self.client_id,
            stream,
            self.registry.clone(),
            self.metrics.clone(),
        );

        tokio::spawn(async move {
            if let Err(err) = conn.run().await {
                log::error!("RTMP connection error: {}", err);
            }
        });
    }
}

enum State {
    Initializing,
    Publishing {
        name: String,
        source: mpsc::UnboundedSender<Packet>,
        info: Arc<RwLock<StreamInfo>>,
    },
    Disconnecting,
}

struct Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    id: u64,
    bytes_stream: Framed<S, BytesCodec>,
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    proto: Protocol,
    state: State,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(id: u64, stream: S, registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            id,
            bytes_stream: Framed::new(stream, BytesCodec::new()),
            registry,
            metrics,
            proto: Protocol::new(),
            state: State::Initializing,
        }
    }

    async fn run(mut self) -> Result<()> {
        loop {
            if matches!(self.state, State::Disconnecting) {
                log::debug!("Client {} disconnecting", self.id);
                return Ok(());
            }

            let next = self.bytes_stream.try_next();
            match timeout(TIME_OUT, next).await? {
                Ok(Some(data)) => {
                    for event in self.proto.handle_bytes(&data)? {
                        self.handle_event(event).await?;
                    }
                }
                _ => self.disconnect(),
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::ReturnData(data) => {
                let send = self.bytes_stream.send(data);
                timeout(TIME_OUT, send).await??;
            }
            Event::PublishRequested { app, key } => {
                let path = if key.is_empty() {
                    format!("/{}", app)
                } else {
                    format!("/{}/{}", app, key)
                };
                let cfg = match self.registry.ingest_by_path(&path).await {
                    Some(cfg) => cfg,
                    // unknown path: reject the publish by closing
                    None => return Err(PError::NoSuchIngest(path).into()),
                };
                log::info!(
                    "Publish started on {} for ingest {} with {} outputs",
                    path,
                    cfg.name,
                    cfg.outputs.len()
                );

                for event in self.proto.accept_publish()? {
                    if let Event::ReturnData(data) = event {
                        let send = self.bytes_stream.send(data);
                        timeout(TIME_OUT, send).await??;
                    }
                }

                let (source_tx, source_rx) = mpsc::unbounded_channel();
                let info = Arc::new(RwLock::new(StreamInfo::default()));
                let session = IngestSession::new(
                    cfg.name.clone(),
                    self.registry.clone(),
                    self.metrics.clone(),
                    info.clone(),
                    source_rx,
                );
                tokio::spawn(session.run());

                self.state = State::Publishing {
                    name: cfg.name,
                    source: source_tx,
                    info,
                };
            }
            Event::PublishFinished => self.disconnect(),
            Event::PlayRequested { app } => {
                log::info!("Play request for {} accepted and closed", app);
                self.disconnect();
            }
            Event::Metadata(metadata) => {
                if let State::Publishing { info, .. } = &self.state {
                    info.write().await.metadata = Some(metadata);
                }
            }
            Event::VideoData {
                timestamp_ms,
                payload,
            } => self.forward_video(timestamp_ms, payload).await?,
            Event::AudioData {
                timestamp_ms,
                payload,
            } => self.forward_audio(timestamp_ms, payload).await?,
        }
        Ok(())
    }

    async fn forward_video(&mut self, timestamp_ms: u32, payload: Bytes) -> Result<()> {
        let (source, info) = match &self.state {
            State::Publishing { source, info, .. } => (source, info),
            _ => return Ok(()),
        };

        let tag = match VideoData::try_from(payload.as_ref()) {
            Ok(tag) => tag,
            Err(err) => {
                log::debug!("Skipping unparseable video tag: {}", err);
                return Ok(());
            }
        };

        if tag.is_sequence_header() {
            info.write().await.video_header = Some(payload);
            return Ok(());
        }

        let packet = Packet {
            kind: crate::packet::PacketKind::Video,
            time: Duration::from_millis(timestamp_ms as u64),
            composition_time: Duration::from_millis(tag.composition_time_ms()),
            keyframe: tag.is_keyframe(),
            payload,
        };
        source.send(packet).map_err(|_| PError::SessionSendFailed)?;
        Ok(())
    }

    async fn forward_audio(&mut self, timestamp_ms: u32, payload: Bytes) -> Result<()> {
        let (source, info) = match &self.state {
            State::Publishing { source, info, .. } => (source, info),
            _ => return Ok(()),
        };

        match AudioData::try_from(payload.as_ref()) {
            Ok(tag) if tag.is_sequence_header => {
                info.write().await.audio_header = Some(payload);
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                log::debug!("Skipping unparseable audio tag: {}", err);
                return Ok(());
            }
        }

        let packet = Packet {
            kind: crate::packet::PacketKind::Audio,
            time: Duration::from_millis(timestamp_ms as u64),
            composition_time: Duration::ZERO,
            keyframe: false,
            payload,
        };
        source.send(packet).map_err(|_| PError::SessionSendFailed)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let State::Publishing { name, .. } = &self.state {
            log::info!("Publish finished for ingest {}", name);
        }
        // dropping the source sender ends the session's reader loop
        self.state = State::Disconnecting;
    }
}

impl<S> Drop for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        log::info!("RTMP client {} disconnected", self.id);
    }
}
