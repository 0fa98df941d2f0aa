use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};

use crate::error::Error;

/// Events surfaced to the connection state machine.
pub enum Event {
    /// Bytes to send back to the peer.
    ReturnData(Bytes),
    /// A publisher asked to publish on app/key; accept or close.
    PublishRequested { app: String, key: String },
    PublishFinished,
    /// A player asked to play; the relay closes these.
    PlayRequested { app: String },
    Metadata(StreamMetadata),
    VideoData { timestamp_ms: u32, payload: Bytes },
    AudioData { timestamp_ms: u32, payload: Bytes },
}

enum Stage {
    Handshake(Handshake),
    Session(ServerSession),
}

/// Server-side RTMP protocol driver: raw bytes in, events out. Wraps the
/// rml_rtmp handshake and server session.
pub struct Protocol {
    stage: Option<Stage>,
    pending_publish: Option<u32>,
}

impl Protocol {
    pub fn new() -> Self {
        Self {
            stage: Some(Stage::Handshake(Handshake::new(PeerType::Server))),
            pending_publish: None,
        }
    }

    pub fn handle_bytes(&mut self, input: &[u8]) -> Result<Vec<Event>, Error> {
        match self.stage.take() {
            Some(Stage::Handshake(mut handshake)) => {
                let result = handshake
                    .process_bytes(input)
                    .map_err(|_| Error::HandshakeFailed)?;
                match result {
                    HandshakeProcessResult::InProgress { response_bytes } => {
                        self.stage = Some(Stage::Handshake(handshake));
                        let mut events = Vec::new();
                        if !response_bytes.is_empty() {
                            events.push(Event::ReturnData(response_bytes.into()));
                        }
                        Ok(events)
                    }
                    HandshakeProcessResult::Completed {
                        response_bytes,
                        remaining_bytes,
                    } => {
                        let mut events = Vec::new();
                        if !response_bytes.is_empty() {
                            events.push(Event::ReturnData(response_bytes.into()));
                        }

                        let config = ServerSessionConfig::new();
                        let (mut session, initial) = ServerSession::new(config)
                            .map_err(|_| Error::SessionInitializationFailed)?;
                        self.collect_results(&mut session, initial, &mut events)?;

                        if !remaining_bytes.is_empty() {
                            let results = session
                                .handle_input(&remaining_bytes)
                                .map_err(|_| Error::InvalidInput)?;
                            self.collect_results(&mut session, results, &mut events)?;
                        }

                        self.stage = Some(Stage::Session(session));
                        Ok(events)
                    }
                }
            }
            Some(Stage::Session(mut session)) => {
                let results = session
                    .handle_input(input)
                    .map_err(|_| Error::InvalidInput)?;
                let mut events = Vec::new();
                self.collect_results(&mut session, results, &mut events)?;
                self.stage = Some(Stage::Session(session));
                Ok(events)
            }
            None => Err(Error::SessionInitializationFailed),
        }
    }

    /// Accepts the pending publish request, once the connection resolved
    /// the path to a configured ingest.
    pub fn accept_publish(&mut self) -> Result<Vec<Event>, Error> {
        let request_id = self.pending_publish.take().ok_or(Error::InvalidInput)?;
        match self.stage.as_mut() {
            Some(Stage::Session(session)) => {
                let results = session
                    .accept_request(request_id)
                    .map_err(|_| Error::RequestRejected)?;
                let mut events = Vec::new();
                // accept never raises nested requests, plain mapping is enough
                for result in results {
                    if let ServerSessionResult::OutboundResponse(packet) = result {
                        events.push(Event::ReturnData(packet.bytes.into()));
                    }
                }
                Ok(events)
            }
            _ => Err(Error::SessionInitializationFailed),
        }
    }

    fn collect_results(
        &mut self,
        session: &mut ServerSession,
        results: Vec<ServerSessionResult>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        for result in results {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    events.push(Event::ReturnData(packet.bytes.into()));
                }
                ServerSessionResult::RaisedEvent(event) => {
                    self.handle_session_event(session, event, events)?;
                }
                ServerSessionResult::UnhandleableMessageReceived(_) => {
                    log::debug!("Unhandleable RTMP message ignored");
                }
            }
        }
        Ok(())
    }

    fn handle_session_event(
        &mut self,
        session: &mut ServerSession,
        event: ServerSessionEvent,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        match event {
            ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                let results = session
                    .accept_request(request_id)
                    .map_err(|_| Error::RequestRejected)?;
                self.collect_results(session, results, events)?;
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                ..
            } => {
                self.pending_publish = Some(request_id);
                events.push(Event::PublishRequested {
                    app: app_name,
                    key: stream_key,
                });
            }
            ServerSessionEvent::PublishStreamFinished { .. } => {
                events.push(Event::PublishFinished);
            }
            ServerSessionEvent::PlayStreamRequested {
                request_id,
                app_name,
                ..
            } => {
                // accepted, then the connection closes it right away
                if let Ok(results) = session.accept_request(request_id) {
                    self.collect_results(session, results, events)?;
                }
                events.push(Event::PlayRequested { app: app_name });
            }
            ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
                events.push(Event::Metadata(metadata));
            }
            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                events.push(Event::VideoData {
                    timestamp_ms: timestamp.value,
                    payload: data,
                });
            }
            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                events.push(Event::AudioData {
                    timestamp_ms: timestamp.value,
                    payload: data,
                });
            }
            other => {
                log::debug!("Ignoring RTMP session event: {:?}", other);
            }
        }
        Ok(())
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}
