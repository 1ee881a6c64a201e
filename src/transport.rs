//! WebSocket transport to the conversational endpoint.
//!
//! One logical connection per session: `connect` performs the protocol
//! handshake and hands back an event stream, a single tokio task owns the
//! split socket afterwards, and any terminal failure surfaces exactly once
//! as a `Closed` or `Error` event. There is no automatic reconnection;
//! the caller starts a new session instead.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::Config;
use crate::error::VoiceError;
use crate::pcm::WireChunk;
use crate::protocol::{AudioMessage, HelloMessage, ServerMessage};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound payloads, delivered in arrival order on one channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// One chunk of the endpoint's spoken reply, 24 kHz PCM16.
    Audio(WireChunk),
    /// The endpoint detected the user speaking over model speech.
    Interrupted,
    /// A text transcript line for the caller's chat view.
    Transcript { role: String, text: String },
    /// Graceful end of session.
    Closed(String),
    /// Terminal transport failure.
    Error(String),
}

#[derive(Debug)]
enum TransportCommand {
    Send(String),
    Close,
}

/// Handle to an open session connection.
pub struct Transport {
    cmd_tx: Option<mpsc::Sender<TransportCommand>>,
    io_task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Open the connection, run the hello negotiation, and spawn the I/O
    /// task. Suspends until the endpoint acknowledges or rejects.
    pub async fn connect(
        config: &Config,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), VoiceError> {
        let request = build_request(config)?;

        log::info!("Connecting to {}...", config.ws_url);
        let (mut ws_stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| VoiceError::Connect("handshake timed out".to_string()))?
            .map_err(|e| VoiceError::Connect(e.to_string()))?;

        // 发送Hello消息进行初始化链接
        let hello_json = serde_json::to_string(&HelloMessage::new(config))
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        ws_stream
            .send(Message::Text(hello_json.into()))
            .await
            .map_err(|e| VoiceError::Connect(e.to_string()))?;

        tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_for_hello_ack(&mut ws_stream))
            .await
            .map_err(|_| VoiceError::Connect("negotiation timed out".to_string()))??;
        log::info!("Connected!");

        let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(config.channel_capacity);
        let io_task = tokio::spawn(io_loop(ws_stream, cmd_rx, event_tx));

        Ok((Self { cmd_tx: Some(cmd_tx), io_task: Some(io_task) }, event_rx))
    }

    /// Best-effort send of one outbound audio chunk. A full outbound queue
    /// drops the chunk with a warning; one lost frame degrades audio but
    /// must not end the session.
    pub fn send(&self, chunk: WireChunk) {
        let json = match serde_json::to_string(&AudioMessage::new(chunk)) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize audio message: {}", e);
                return;
            }
        };
        let Some(cmd_tx) = &self.cmd_tx else {
            log::warn!("Transport closed, dropping audio chunk");
            return;
        };
        match cmd_tx.try_send(TransportCommand::Send(json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound queue full, dropping one audio chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Transport closed, dropping audio chunk");
            }
        }
    }

    /// Graceful shutdown handshake. Idempotent; once it returns the event
    /// channel drains and yields `None`, never another event.
    ///
    /// Dropping the command sender closes the channel, which the I/O task
    /// sees as a close request even when the queue is full of unsent
    /// audio. A peer that never completes the close handshake gets the
    /// task aborted after the timeout.
    pub async fn close(&mut self) {
        let Some(io_task) = self.io_task.take() else {
            return;
        };
        self.cmd_tx.take();
        let abort = io_task.abort_handle();
        if tokio::time::timeout(CLOSE_TIMEOUT, io_task).await.is_err() {
            log::warn!("Transport I/O task did not stop in time, aborting");
            abort.abort();
        }
    }
}

fn build_request(
    config: &Config,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, VoiceError> {
    let url = Url::parse(&config.ws_url).map_err(|e| VoiceError::Connect(e.to_string()))?;
    let host = url.host_str().unwrap_or("localhost");

    tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(config.ws_url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", config.api_token))
        .header("Client-Id", &config.client_id)
        .header("Protocol-Version", "1")
        .body(())
        .map_err(|e| VoiceError::Connect(e.to_string()))
}

/// Read until the server's `hello` ack. An `error` message or a close
/// frame here is a rejection of the session attempt.
async fn wait_for_hello_ack(ws_stream: &mut WsStream) -> Result<(), VoiceError> {
    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: ServerMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Unparseable message during negotiation: {}", e);
                        continue;
                    }
                };
                match msg.msg_type.as_str() {
                    "hello" => return Ok(()),
                    "error" => {
                        return Err(VoiceError::Connect(
                            msg.detail.unwrap_or_else(|| "rejected by server".to_string()),
                        ));
                    }
                    other => log::debug!("Ignoring '{}' before hello ack", other),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(VoiceError::Connect(format!(
                    "server closed during negotiation: {:?}",
                    frame
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(VoiceError::Connect(e.to_string())),
            None => return Err(VoiceError::Connect("connection closed".to_string())),
        }
    }
}

/// Single owner of the split socket: relays outbound commands and maps
/// inbound messages to events until either side ends the session.
async fn io_loop(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: Result<ServerMessage, _> = serde_json::from_str(&text);
                        match parsed {
                            Ok(msg) => {
                                if let Some(event) = map_server_message(msg) {
                                    let terminal = matches!(
                                        event,
                                        TransportEvent::Closed(_) | TransportEvent::Error(_)
                                    );
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                    if terminal {
                                        break;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Unparseable server message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        let _ = event_tx
                            .send(TransportEvent::Closed("server closed connection".to_string()))
                            .await;
                        break;
                    }
                    // Ping/pong are handled by the protocol layer; binary
                    // frames are not part of this contract.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = event_tx
                            .send(TransportEvent::Closed("connection closed".to_string()))
                            .await;
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCommand::Send(json)) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            let _ = event_tx
                                .send(TransportEvent::Error(format!("send failed: {}", e)))
                                .await;
                            break;
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Transport I/O task finished");
}

fn map_server_message(msg: ServerMessage) -> Option<TransportEvent> {
    match msg.msg_type.as_str() {
        "audio" => match msg.audio {
            Some(audio) => {
                if let Some(mime) = &audio.mime_type {
                    if !mime.contains("rate=24000") {
                        log::warn!("Unexpected playback rate tag '{}'", mime);
                    }
                }
                Some(TransportEvent::Audio(WireChunk::from_base64(audio.data)))
            }
            None => {
                log::warn!("Audio message without payload, skipping");
                None
            }
        },
        "interrupted" => Some(TransportEvent::Interrupted),
        "transcript" => Some(TransportEvent::Transcript {
            role: msg.role.unwrap_or_else(|| "model".to_string()),
            text: msg.text.unwrap_or_default(),
        }),
        "goodbye" => Some(TransportEvent::Closed(
            msg.reason.unwrap_or_else(|| "server ended the session".to_string()),
        )),
        "error" => Some(TransportEvent::Error(
            msg.detail.unwrap_or_else(|| "unspecified server error".to_string()),
        )),
        // A duplicate hello after negotiation carries nothing new.
        "hello" => None,
        other => {
            log::debug!("Unhandled message type: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{SplitSink, SplitStream};
    use tokio::net::TcpListener;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn start_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{}", addr)
    }

    /// Server side of the hello negotiation.
    async fn ack_hello(
        write: &mut SplitSink<ServerWs, Message>,
        read: &mut SplitStream<ServerWs>,
    ) {
        let first = read.next().await.unwrap().unwrap();
        let msg: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(msg["type"], "hello");
        assert_eq!(msg["audio_params"]["format"], "pcm16");
        write
            .send(Message::Text(r#"{"type":"hello","session_id":"s1"}"#.into()))
            .await
            .unwrap();
    }

    fn test_config(ws_url: String) -> Config {
        let mut config = Config::default();
        config.ws_url = ws_url;
        config
    }

    #[tokio::test]
    async fn connect_negotiates_and_close_is_idempotent() {
        let url = start_server(|ws| async move {
            let (mut write, mut read) = ws.split();
            ack_hello(&mut write, &mut read).await;
            // Stay up until the client closes.
            while let Some(Ok(msg)) = read.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;

        let (mut transport, mut event_rx) =
            Transport::connect(&test_config(url)).await.unwrap();
        transport.close().await;
        transport.close().await;
        // No events after close resolves.
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wins_over_backlogged_sends() {
        use crate::pcm::{AudioFrame, CAPTURE_SAMPLE_RATE, encode};

        let url = start_server(|ws| async move {
            let (mut write, mut read) = ws.split();
            ack_hello(&mut write, &mut read).await;
            while let Some(Ok(msg)) = read.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;

        let mut config = test_config(url);
        config.channel_capacity = 2;
        let (mut transport, mut event_rx) = Transport::connect(&config).await.unwrap();

        // Flood the outbound queue past capacity; the current-thread
        // runtime gives the I/O task no chance to drain it first.
        let chunk = encode(&AudioFrame::new(vec![0.1; 160], CAPTURE_SAMPLE_RATE));
        for _ in 0..8 {
            transport.send(chunk.clone());
        }

        // Close must still stop the I/O task and end the event stream.
        transport.close().await;
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_end_on_goodbye() {
        let url = start_server(|ws| async move {
            let (mut write, mut read) = ws.split();
            ack_hello(&mut write, &mut read).await;
            for msg in [
                r#"{"type":"audio","audio":{"data":"AAAAAA==","mime_type":"audio/pcm;rate=24000"}}"#,
                r#"{"type":"interrupted"}"#,
                r#"{"type":"transcript","role":"model","text":"hello there"}"#,
                r#"{"type":"goodbye","reason":"done"}"#,
            ] {
                write.send(Message::Text(msg.into())).await.unwrap();
            }
        })
        .await;

        let (_transport, mut event_rx) =
            Transport::connect(&test_config(url)).await.unwrap();

        assert!(matches!(event_rx.recv().await, Some(TransportEvent::Audio(_))));
        assert!(matches!(event_rx.recv().await, Some(TransportEvent::Interrupted)));
        match event_rx.recv().await {
            Some(TransportEvent::Transcript { role, text }) => {
                assert_eq!(role, "model");
                assert_eq!(text, "hello there");
            }
            other => panic!("expected transcript, got {:?}", other),
        }
        match event_rx.recv().await {
            Some(TransportEvent::Closed(reason)) => assert_eq!(reason, "done"),
            other => panic!("expected closed, got {:?}", other),
        }
        // Terminal event ends the stream.
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_delivers_audio_chunks() {
        use crate::pcm::{AudioFrame, CAPTURE_SAMPLE_RATE, encode};

        let (seen_tx, mut seen_rx) = mpsc::channel::<serde_json::Value>(1);
        let url = start_server(move |ws| async move {
            let (mut write, mut read) = ws.split();
            ack_hello(&mut write, &mut read).await;
            let msg = read.next().await.unwrap().unwrap();
            let value: serde_json::Value =
                serde_json::from_str(msg.to_text().unwrap()).unwrap();
            seen_tx.send(value).await.unwrap();
        })
        .await;

        let (transport, _event_rx) = Transport::connect(&test_config(url)).await.unwrap();
        let chunk = encode(&AudioFrame::new(vec![0.25; 160], CAPTURE_SAMPLE_RATE));
        let expected = chunk.as_str().to_string();
        transport.send(chunk);

        let value = seen_rx.recv().await.unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["audio"]["mime_type"], "audio/pcm;rate=16000");
        assert_eq!(value["audio"]["data"], expected.as_str());
    }

    #[tokio::test]
    async fn rejection_during_negotiation_fails_connect() {
        let url = start_server(|ws| async move {
            let (mut write, mut read) = ws.split();
            let _ = read.next().await;
            write
                .send(Message::Text(
                    r#"{"type":"error","detail":"bad token"}"#.into(),
                ))
                .await
                .unwrap();
        })
        .await;

        match Transport::connect(&test_config(url)).await {
            Err(VoiceError::Connect(detail)) => assert!(detail.contains("bad token")),
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_connect() {
        // Port 1 is essentially never listening.
        let result = Transport::connect(&test_config("ws://127.0.0.1:1".to_string())).await;
        assert!(matches!(result, Err(VoiceError::Connect(_))));
    }
}
