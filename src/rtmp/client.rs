use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use futures::SinkExt;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult, PublishRequestType,
    StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, Framed};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// rtmp://host[:port]/app/stream_key, split for the connect/publish pair.
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl RtmpTarget {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let rest = url
            .strip_prefix("rtmp://")
            .ok_or_else(|| anyhow!("not an rtmp:// URL: {}", url))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => bail!("rtmp URL missing app/stream path: {}", url),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().context("rtmp port")?),
            None => (authority.to_string(), 1935),
        };
        if host.is_empty() {
            bail!("rtmp URL missing host: {}", url);
        }
        let (app, stream_key) = match path.split_once('/') {
            Some((app, key)) => (app.to_string(), key.to_string()),
            None => (path.to_string(), String::new()),
        };
        if app.is_empty() {
            bail!("rtmp URL missing app: {}", url);
        }
        Ok(Self {
            host,
            port,
            app,
            stream_key,
        })
    }
}

/// Publishing RTMP client: dial, handshake, connect the app, request
/// publish, then push tag payloads.
pub struct RtmpClient {
    stream: Framed<TcpStream, BytesCodec>,
    session: ClientSession,
}

impl RtmpClient {
    pub async fn connect(url: &str, dial_timeout: Duration) -> anyhow::Result<Self> {
        let target = RtmpTarget::parse(url)?;
        let addr = format!("{}:{}", target.host, target.port);
        let tcp = timeout(dial_timeout, TcpStream::connect(&addr))
            .await
            .context("rtmp dial timeout")??;
        tcp.set_nodelay(true)?;
        let mut stream = Framed::new(tcp, BytesCodec::new());

        // client handshake
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_and_p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| anyhow!("handshake generation failed: {:?}", e))?;
        stream.send(Bytes::from(p0_and_p1)).await?;

        let leftover = loop {
            let data = read_frame(&mut stream).await?;
            match handshake
                .process_bytes(&data)
                .map_err(|e| anyhow!("handshake failed: {:?}", e))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.send(Bytes::from(response_bytes)).await?;
                    }
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    if !response_bytes.is_empty() {
                        stream.send(Bytes::from(response_bytes)).await?;
                    }
                    break remaining_bytes;
                }
            }
        };

        let config = ClientSessionConfig::new();
        let (session, initial) = ClientSession::new(config)
            .map_err(|e| anyhow!("client session init failed: {:?}", e))?;
        let mut client = Self { stream, session };
        client.dispatch(initial).await?;
        if !leftover.is_empty() {
            let results = client
                .session
                .handle_input(&leftover)
                .map_err(|e| anyhow!("rtmp input error: {:?}", e))?;
            client.dispatch(results).await?;
        }

        // connect to the application, then request publishing
        let result = client
            .session
            .request_connection(target.app.clone())
            .map_err(|e| anyhow!("connection request failed: {:?}", e))?;
        client.dispatch(vec![result]).await?;
        client
            .wait_for(|event| matches!(event, ClientSessionEvent::ConnectionRequestAccepted))
            .await?;

        let result = client
            .session
            .request_publishing(target.stream_key.clone(), PublishRequestType::Live)
            .map_err(|e| anyhow!("publish request failed: {:?}", e))?;
        client.dispatch(vec![result]).await?;
        client
            .wait_for(|event| matches!(event, ClientSessionEvent::PublishRequestAccepted { .. }))
            .await?;

        log::info!("RTMP publish established: {}", url);
        Ok(client)
    }

    pub async fn publish_metadata(&mut self, metadata: &StreamMetadata) -> anyhow::Result<()> {
        let result = self
            .session
            .publish_metadata(metadata)
            .map_err(|e| anyhow!("publish metadata failed: {:?}", e))?;
        self.dispatch(vec![result]).await
    }

    /// `payload` is a complete FLV video tag body.
    pub async fn publish_video(&mut self, payload: Bytes, timestamp_ms: u32) -> anyhow::Result<()> {
        let result = self
            .session
            .publish_video_data(payload, RtmpTimestamp::new(timestamp_ms), false)
            .map_err(|e| anyhow!("publish video failed: {:?}", e))?;
        self.dispatch(vec![result]).await
    }

    /// `payload` is a complete FLV audio tag body.
    pub async fn publish_audio(&mut self, payload: Bytes, timestamp_ms: u32) -> anyhow::Result<()> {
        let result = self
            .session
            .publish_audio_data(payload, RtmpTimestamp::new(timestamp_ms), false)
            .map_err(|e| anyhow!("publish audio failed: {:?}", e))?;
        self.dispatch(vec![result]).await
    }

    /// Consumes whatever the server has sent (acks, window updates)
    /// without blocking the write path.
    pub async fn drain_input(&mut self) -> anyhow::Result<()> {
        use futures::FutureExt;
        loop {
            match self.stream.next().now_or_never() {
                Some(Some(Ok(data))) => {
                    let results = self
                        .session
                        .handle_input(&data)
                        .map_err(|e| anyhow!("rtmp input error: {:?}", e))?;
                    self.dispatch(results).await?;
                }
                Some(Some(Err(e))) => return Err(e.into()),
                Some(None) => bail!("rtmp connection closed by peer"),
                None => return Ok(()),
            }
        }
    }

    async fn wait_for<F>(&mut self, pred: F) -> anyhow::Result<()>
    where
        F: Fn(&ClientSessionEvent) -> bool,
    {
        loop {
            let data = read_frame(&mut self.stream).await?;
            let results = self
                .session
                .handle_input(&data)
                .map_err(|e| anyhow!("rtmp input error: {:?}", e))?;
            let mut matched = false;
            for result in results {
                match result {
                    ClientSessionResult::OutboundResponse(packet) => {
                        self.stream.send(Bytes::from(packet.bytes)).await?;
                    }
                    ClientSessionResult::RaisedEvent(event) => {
                        if let ClientSessionEvent::ConnectionRequestRejected { description } =
                            &event
                        {
                            bail!("rtmp connection rejected: {}", description);
                        }
                        if pred(&event) {
                            matched = true;
                        }
                    }
                    ClientSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }
            if matched {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, results: Vec<ClientSessionResult>) -> anyhow::Result<()> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    let send = self.stream.send(Bytes::from(packet.bytes));
                    timeout(IO_TIMEOUT, send)
                        .await
                        .context("rtmp write timeout")??;
                }
                ClientSessionResult::RaisedEvent(event) => {
                    log::debug!("RTMP client event: {:?}", event);
                }
                ClientSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
        Ok(())
    }
}

async fn read_frame(stream: &mut Framed<TcpStream, BytesCodec>) -> anyhow::Result<bytes::BytesMut> {
    match timeout(IO_TIMEOUT, stream.try_next()).await? {
        Ok(Some(data)) => Ok(data),
        Ok(None) => bail!("rtmp connection closed by peer"),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        let t = RtmpTarget::parse("rtmp://example.com/live/key").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 1935);
        assert_eq!(t.app, "live");
        assert_eq!(t.stream_key, "key");

        let t = RtmpTarget::parse("rtmp://example.com:19350/app/a/b").unwrap();
        assert_eq!(t.port, 19350);
        assert_eq!(t.app, "app");
        assert_eq!(t.stream_key, "a/b");
    }

    #[test]
    fn target_parsing_rejects_malformed() {
        assert!(RtmpTarget::parse("http://example.com/live").is_err());
        assert!(RtmpTarget::parse("rtmp://example.com").is_err());
        assert!(RtmpTarget::parse("rtmp:///live/key").is_err());
    }
}
