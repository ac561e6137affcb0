use crate::types;
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};

pub mod config;
mod consts;

type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type InputTx = tokio::sync::mpsc::Sender<String>;
/// Receiver half of the response-audio stream: raw PCM frames, in production
/// order, single consumer.
pub type AudioRx = tokio::sync::mpsc::Receiver<Vec<u8>>;

const DEFAULT_CAPACITY: usize = 128;

/// A live bidirectional audio session against the Gemini Live API.
///
/// Audio sent with [`Session::send_audio`] is queued on a bounded channel; a
/// saturated channel blocks the caller rather than dropping frames.
pub struct Session {
    input_tx: Option<InputTx>,
    responses: Option<AudioRx>,
}

/// Establishes a session with default channel capacity.
pub async fn connect(config: &config::Config) -> Result<Session> {
    connect_with_capacity(config, DEFAULT_CAPACITY).await
}

/// Establishes a connection, performs the session setup handshake, and spawns
/// the two socket tasks bridging the connection to channels.
pub async fn connect_with_capacity(config: &config::Config, capacity: usize) -> Result<Session> {
    let url = format!(
        "{}?key={}",
        config.base_url(),
        config.api_key().expose_secret()
    );
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Gemini Live WebSocket")?;
    tracing::info!("Connected to Gemini Live.");

    let (mut write, mut read) = ws_stream.split();

    let setup = types::SetupRequest {
        setup: types::Setup {
            model: config.model().to_string(),
            generation_config: types::GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
        },
    };
    let json = serde_json::to_string(&setup)?;
    write
        .send(Message::Text(json))
        .await
        .context("Failed to send session setup")?;

    // The server will not accept audio until it acknowledges the setup.
    wait_for_setup(&mut read).await?;

    let (input_tx, mut input_rx) = tokio::sync::mpsc::channel::<String>(capacity);
    let (audio_tx, audio_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(capacity);

    // Writer task: drains queued client messages onto the socket. Ends when
    // the session drops its sender, after which the server is told to close.
    tokio::spawn(async move {
        while let Some(text) = input_rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::error!("failed to send message to Gemini: {}", e);
                break;
            }
        }
        if let Err(e) = write.send(Message::Close(None)).await {
            tracing::debug!("failed to send close frame: {}", e);
        }
    });

    // Reader task: decodes server messages and forwards audio frames, in
    // arrival order, to the response channel. Dropping `audio_tx` at the end
    // terminates the response stream for the consumer.
    tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("error reading from Gemini WebSocket: {}", e);
                    break;
                }
            };
            match message {
                Message::Text(text) => {
                    match serde_json::from_str::<types::ServerMessage>(&text) {
                        Ok(event) => {
                            if !forward_audio(event, &audio_tx).await {
                                // Consumer is gone; no point reading further.
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("failed to deserialize server event: {}", e),
                    }
                }
                Message::Binary(bin) => {
                    tracing::warn!("unexpected binary message from server ({} bytes)", bin.len());
                }
                Message::Close(reason) => {
                    tracing::info!("Gemini session closed: {:?}", reason);
                    break;
                }
                _ => { /* Ignore Ping/Pong */ }
            }
        }
    });

    Ok(Session {
        input_tx: Some(input_tx),
        responses: Some(audio_rx),
    })
}

async fn wait_for_setup(read: &mut WsReader) -> Result<()> {
    while let Some(message) = read.next().await {
        match message.context("error reading from Gemini WebSocket during setup")? {
            Message::Text(text) => {
                let event: types::ServerMessage = serde_json::from_str(&text)
                    .context("failed to deserialize server event during setup")?;
                if event.setup_complete.is_some() {
                    tracing::debug!("Gemini session setup complete");
                    return Ok(());
                }
                tracing::debug!("ignoring server message received before setup ack");
            }
            Message::Close(reason) => {
                anyhow::bail!("connection closed during setup: {:?}", reason)
            }
            _ => {}
        }
    }
    anyhow::bail!("connection ended before setup completed")
}

/// Extracts audio parts from a server message and pushes them to the response
/// channel. Returns `false` once the receiving side has been dropped.
async fn forward_audio(
    message: types::ServerMessage,
    audio_tx: &tokio::sync::mpsc::Sender<Vec<u8>>,
) -> bool {
    let Some(content) = message.server_content else {
        return true;
    };
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(blob) = part.inline_data {
                if !blob.mime_type.starts_with("audio/pcm") {
                    tracing::debug!("ignoring non-audio blob: {}", blob.mime_type);
                    continue;
                }
                match general_purpose::STANDARD.decode(blob.data.as_bytes()) {
                    Ok(frame) => {
                        if audio_tx.send(frame).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => tracing::warn!("undecodable audio payload from server: {}", e),
                }
            } else if let Some(text) = part.text {
                // Text output is out of scope for audio relaying.
                tracing::debug!("ignoring model text part: {}", text);
            }
        }
    }
    if content.turn_complete == Some(true) {
        tracing::debug!("model turn complete");
    }
    true
}

impl Session {
    /// Queues a chunk of raw 16kHz PCM for the model to consume.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        let request = types::RealtimeInputRequest {
            realtime_input: types::RealtimeInput {
                media_chunks: vec![types::MediaChunk {
                    mime_type: consts::INPUT_MIME_TYPE.to_string(),
                    data: general_purpose::STANDARD.encode(pcm),
                }],
            },
        };
        let json = serde_json::to_string(&request)?;
        match &self.input_tx {
            Some(tx) => tx
                .send(json)
                .await
                .map_err(|_| anyhow::anyhow!("session is closed")),
            None => Err(anyhow::anyhow!("session is closed")),
        }
    }

    /// Takes the response-audio receiver. The stream is single-consumption;
    /// a second call fails rather than handing out a competing receiver.
    pub fn responses(&mut self) -> Result<AudioRx> {
        self.responses
            .take()
            .ok_or_else(|| anyhow::anyhow!("responses stream has already been taken"))
    }

    /// Releases the session. Idempotent; safe to call after partial failure.
    pub fn close(&mut self) {
        if self.input_tx.take().is_some() {
            tracing::debug!("Gemini session close requested");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_can_only_be_taken_once() {
        let (input_tx, _input_rx) = tokio::sync::mpsc::channel(1);
        let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(1);
        let mut session = Session {
            input_tx: Some(input_tx),
            responses: Some(audio_rx),
        };

        assert!(session.responses().is_ok());
        assert!(session.responses().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_audio() {
        let (input_tx, _input_rx) = tokio::sync::mpsc::channel(1);
        let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(1);
        let mut session = Session {
            input_tx: Some(input_tx),
            responses: Some(audio_rx),
        };

        session.close();
        session.close();
        assert!(session.send_audio(b"AAAA").await.is_err());
    }

    #[tokio::test]
    async fn forward_audio_decodes_frames_in_order() {
        let (audio_tx, mut audio_rx) = tokio::sync::mpsc::channel(8);
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAEC"}},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AwQF"}}
                    ]
                }
            }
        }"#;
        let message: types::ServerMessage = serde_json::from_str(raw).unwrap();

        assert!(forward_audio(message, &audio_tx).await);
        assert_eq!(audio_rx.recv().await.unwrap(), vec![0u8, 1, 2]);
        assert_eq!(audio_rx.recv().await.unwrap(), vec![3u8, 4, 5]);
    }

    #[tokio::test]
    async fn forward_audio_skips_non_audio_parts() {
        let (audio_tx, mut audio_rx) = tokio::sync::mpsc::channel(8);
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"text": "hello"},
                        {"inlineData": {"mimeType": "image/png", "data": "AAEC"}},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "Bgc="}}
                    ]
                },
                "turnComplete": true
            }
        }"#;
        let message: types::ServerMessage = serde_json::from_str(raw).unwrap();

        assert!(forward_audio(message, &audio_tx).await);
        assert_eq!(audio_rx.recv().await.unwrap(), vec![6u8, 7]);
        assert!(audio_rx.try_recv().is_err());
    }
}
