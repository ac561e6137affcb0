//! The media relay: owns one telephony socket and one AI session, and runs
//! the two pump tasks connecting them.
//!
//! The inbound pump reads socket events strictly sequentially and forwards
//! decoded audio to the AI session; the outbound pump drains the session's
//! response stream back onto the socket. The pumps share nothing but the
//! session handle (split between them) and a cancellation token, observed at
//! suspension points only — a pump is never torn down mid-write.

use crate::events::{self, CodecError, StreamEvent};
use crate::session::{AiSession, SessionFactory};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Name of the mark written after the final AI frame has been flushed, so
/// the provider side can observe playback hand-off.
const PLAYBACK_MARK: &str = "ai-playback-complete";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("AI session could not be opened")]
    SessionUnavailable(#[source] anyhow::Error),
    #[error("socket transport failed: {0}")]
    Transport(String),
    #[error("AI session failed mid-call")]
    Session(#[source] anyhow::Error),
    #[error("provider reported stream error {code}: {message}")]
    Upstream { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

/// Diagnostic summary of a finished call.
#[derive(Debug, Default)]
pub struct CallSummary {
    pub stream_sid: Option<String>,
    pub frames_from_caller: u64,
    pub frames_to_caller: u64,
    pub error: Option<RelayError>,
}

/// Per-call state. Created when the socket is accepted, destroyed when the
/// call reaches `Closed`; never shared across calls.
struct CallSession {
    state: RelayState,
    summary: CallSummary,
}

impl CallSession {
    fn new() -> Self {
        Self {
            state: RelayState::Connecting,
            summary: CallSummary::default(),
        }
    }

    fn transition(&mut self, next: RelayState) {
        tracing::debug!(from = ?self.state, to = ?next, "relay state change");
        self.state = next;
    }

    // The first error is the one that terminated the call; later ones are
    // usually consequences of the teardown itself.
    fn fail(&mut self, error: RelayError) {
        if self.summary.error.is_none() {
            self.summary.error = Some(error);
        } else {
            tracing::debug!("suppressing secondary relay error: {}", error);
        }
    }
}

enum Dispatch {
    Continue,
    Drain,
}

/// Services one call: opens the AI session, runs both pumps until a
/// terminating event or error, then tears both sides down. The AI session is
/// always closed before the call is discarded.
pub async fn run<Tx, Rx>(tx: Tx, mut rx: Rx, sessions: &dyn SessionFactory) -> CallSummary
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: std::fmt::Display + Send,
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut call = CallSession::new();

    // The AI session is opened eagerly, before the provider's start event
    // arrives, to minimize first-audio latency.
    let mut session = match sessions.open().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("failed to open AI session: {:#}", e);
            call.fail(RelayError::SessionUnavailable(e));
            call.transition(RelayState::Closed);
            return call.summary;
        }
    };
    let responses = match session.responses() {
        Ok(responses) => responses,
        Err(e) => {
            if let Err(e) = session.close().await {
                tracing::warn!("error closing AI session: {}", e);
            }
            call.fail(RelayError::SessionUnavailable(e));
            call.transition(RelayState::Closed);
            return call.summary;
        }
    };
    call.transition(RelayState::Streaming);

    let shutdown = CancellationToken::new();
    let outbound = tokio::spawn(outbound_pump(tx, responses, shutdown.clone()));

    // Inbound pump: strictly sequential socket reads keep frame order intact.
    let inbound_error = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            message = rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match handle_event(&text, &mut call, session.as_mut()).await {
                        Ok(Dispatch::Continue) => {}
                        Ok(Dispatch::Drain) => break None,
                        Err(e) => break Some(e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("telephony socket closed");
                    break None;
                }
                // Binary, ping and pong frames carry no events.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(RelayError::Transport(e.to_string())),
            }
        }
    };

    if let Some(e) = inbound_error {
        call.fail(e);
    }
    call.transition(RelayState::Draining);
    shutdown.cancel();

    if let Err(e) = session.close().await {
        tracing::warn!("error closing AI session: {}", e);
    }

    match outbound.await {
        Ok((sent, outbound_error)) => {
            call.summary.frames_to_caller = sent;
            if let Some(e) = outbound_error {
                call.fail(e);
            }
        }
        Err(e) => tracing::error!("outbound pump panicked: {}", e),
    }

    call.transition(RelayState::Closed);
    call.summary
}

/// Dispatches one decoded socket event. A malformed message is skipped; it
/// must not terminate the call or reorder the frames around it.
async fn handle_event(
    raw: &str,
    call: &mut CallSession,
    session: &mut dyn AiSession,
) -> Result<Dispatch, RelayError> {
    let event = match events::decode(raw) {
        Ok(event) => event,
        Err(CodecError::MalformedEvent(reason)) => {
            tracing::warn!("skipping malformed stream event: {}", reason);
            return Ok(Dispatch::Continue);
        }
    };
    match event {
        StreamEvent::Start { stream_sid, tracks } => {
            tracing::info!(?stream_sid, ?tracks, "media stream started");
            call.summary.stream_sid = stream_sid;
        }
        StreamEvent::Media { payload } => {
            let frame = match events::decode_media_payload(&payload) {
                Ok(frame) => frame,
                Err(CodecError::MalformedEvent(reason)) => {
                    tracing::warn!("skipping undecodable media payload: {}", reason);
                    return Ok(Dispatch::Continue);
                }
            };
            session
                .send_audio(frame)
                .await
                .map_err(RelayError::Session)?;
            call.summary.frames_from_caller += 1;
        }
        StreamEvent::Mark { name } => {
            tracing::debug!(mark = %name, "mark acknowledged by provider");
        }
        StreamEvent::Stop => {
            tracing::info!("media stream stopped by provider");
            return Ok(Dispatch::Drain);
        }
        StreamEvent::Error { code, message } => {
            return Err(RelayError::Upstream {
                code: code.unwrap_or_else(|| "unknown".to_string()),
                message: message.unwrap_or_default(),
            });
        }
        StreamEvent::Unknown(name) => {
            tracing::debug!(event = %name, "ignoring unrecognized stream event");
        }
    }
    Ok(Dispatch::Continue)
}

/// Writes each AI response frame to the socket, in production order, until
/// the sequence ends or the shutdown signal fires. Natural exhaustion of the
/// sequence cancels the sibling pump as well.
async fn outbound_pump<Tx>(
    mut tx: Tx,
    mut responses: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> (u64, Option<RelayError>)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::fmt::Display,
{
    let mut sent = 0u64;
    let error = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            frame = responses.recv() => match frame {
                Some(frame) => {
                    let message = Message::Text(events::encode_media(&frame).into());
                    if let Err(e) = tx.send(message).await {
                        break Some(RelayError::Transport(e.to_string()));
                    }
                    sent += 1;
                }
                None => {
                    // The AI finished its side of the call; tell the provider
                    // the last frame has been flushed.
                    let mark = Message::Text(events::encode_mark(PLAYBACK_MARK).into());
                    if let Err(e) = tx.send(mark).await {
                        break Some(RelayError::Transport(e.to_string()));
                    }
                    break None;
                }
            }
        }
    };
    // Wake the inbound pump at its next suspension point.
    shutdown.cancel();
    (sent, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AudioFrame;
    use anyhow::Result;
    use async_trait::async_trait;
    use base64::{Engine as _, engine::general_purpose};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct MockSession {
        sent: mpsc::UnboundedSender<AudioFrame>,
        responses: Option<mpsc::Receiver<AudioFrame>>,
        closed: Arc<AtomicUsize>,
        fail_sends: bool,
    }

    #[async_trait]
    impl AiSession for MockSession {
        async fn send_audio(&mut self, frame: AudioFrame) -> Result<()> {
            if self.fail_sends {
                anyhow::bail!("ingestion transport saturated and gone");
            }
            self.sent.send(frame)?;
            Ok(())
        }

        fn responses(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
            self.responses
                .take()
                .ok_or_else(|| anyhow::anyhow!("responses stream has already been taken"))
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        session: Mutex<Option<Box<dyn AiSession>>>,
        fail_open: bool,
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn open(&self) -> Result<Box<dyn AiSession>> {
            if self.fail_open {
                anyhow::bail!("provider refused the session");
            }
            Ok(self
                .session
                .lock()
                .unwrap()
                .take()
                .expect("factory can open only one session"))
        }
    }

    /// Everything a test needs to observe and drive one mock session.
    struct Harness {
        factory: MockFactory,
        sent_rx: mpsc::UnboundedReceiver<AudioFrame>,
        // Held open so the outbound pump does not finish prematurely.
        response_tx: mpsc::Sender<AudioFrame>,
        closed: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::channel(16);
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = MockFactory {
            session: Mutex::new(Some(Box::new(MockSession {
                sent: sent_tx,
                responses: Some(response_rx),
                closed: closed.clone(),
                fail_sends: false,
            }))),
            fail_open: false,
        };
        Harness {
            factory,
            sent_rx,
            response_tx,
            closed,
        }
    }

    fn text(raw: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(raw.to_string().into()))
    }

    fn socket_pair() -> (
        futures::channel::mpsc::UnboundedSender<Message>,
        futures::channel::mpsc::UnboundedReceiver<Message>,
    ) {
        futures::channel::mpsc::unbounded()
    }

    async fn written(mut out_rx: futures::channel::mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut written = Vec::new();
        while let Some(message) = out_rx.next().await {
            if let Message::Text(text) = message {
                written.push(serde_json::from_str(&text).unwrap());
            }
        }
        written
    }

    #[tokio::test]
    async fn forwards_caller_audio_in_order_and_closes_once() {
        let mut h = harness();
        let events: Vec<Result<Message, axum::Error>> = vec![
            text(r#"{"event":"start","streamSid":"MZ123","tracks":["inbound"]}"#),
            text(r#"{"event":"media","media":{"payload":"AAAA"}}"#),
            text(r#"{"event":"media","media":{"payload":"BBBB"}}"#),
            text(r#"{"event":"media","media":{"payload":"CCCC"}}"#),
            text(r#"{"event":"stop"}"#),
            // Must never reach the AI: the call drains at `stop`.
            text(r#"{"event":"media","media":{"payload":"DDDD"}}"#),
        ];
        let (out_tx, _out_rx) = socket_pair();

        let summary = run(out_tx, futures::stream::iter(events), &h.factory).await;

        assert!(summary.error.is_none(), "unexpected error: {:?}", summary.error);
        assert_eq!(summary.stream_sid.as_deref(), Some("MZ123"));
        assert_eq!(summary.frames_from_caller, 3);
        for expected in ["AAAA", "BBBB", "CCCC"] {
            let frame = h.sent_rx.recv().await.unwrap();
            assert_eq!(frame, general_purpose::STANDARD.decode(expected).unwrap());
        }
        assert!(h.sent_rx.try_recv().is_err());
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_events_are_skipped_without_frame_loss() {
        let mut h = harness();
        let events: Vec<Result<Message, axum::Error>> = vec![
            text(r#"{"event":"media","media":{"payload":"AAAA"}}"#),
            text("{this is not json"),
            text(r#"{"event":"media"}"#),
            text(r#"{"event":"media","media":{"payload":"not-base64!"}}"#),
            text(r#"{"event":"media","media":{"payload":"BBBB"}}"#),
            text(r#"{"event":"stop"}"#),
        ];
        let (out_tx, _out_rx) = socket_pair();

        let summary = run(out_tx, futures::stream::iter(events), &h.factory).await;

        assert!(summary.error.is_none());
        assert_eq!(summary.frames_from_caller, 2);
        for expected in ["AAAA", "BBBB"] {
            let frame = h.sent_rx.recv().await.unwrap();
            assert_eq!(frame, general_purpose::STANDARD.decode(expected).unwrap());
        }
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_error_event_tears_down_like_stop() {
        let h = harness();
        let events: Vec<Result<Message, axum::Error>> = vec![
            text(r#"{"event":"start","streamSid":"MZ9"}"#),
            text(r#"{"event":"error","error":{"code":31902,"message":"stream died"}}"#),
        ];
        let (out_tx, _out_rx) = socket_pair();

        let summary = run(out_tx, futures::stream::iter(events), &h.factory).await;

        match summary.error {
            Some(RelayError::Upstream { code, message }) => {
                assert_eq!(code, "31902");
                assert_eq!(message, "stream died");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_open_writes_nothing_to_the_socket() {
        let factory = MockFactory {
            session: Mutex::new(None),
            fail_open: true,
        };
        let events: Vec<Result<Message, axum::Error>> = vec![
            text(r#"{"event":"start"}"#),
            text(r#"{"event":"media","media":{"payload":"AAAA"}}"#),
            text(r#"{"event":"stop"}"#),
        ];
        let (out_tx, out_rx) = socket_pair();

        let summary = run(out_tx, futures::stream::iter(events), &factory).await;

        assert!(matches!(
            summary.error,
            Some(RelayError::SessionUnavailable(_))
        ));
        assert_eq!(summary.frames_from_caller, 0);
        assert!(written(out_rx).await.is_empty());
    }

    #[tokio::test]
    async fn outbound_preserves_ai_order_and_marks_completion() {
        let h = harness();
        let frames: Vec<AudioFrame> = vec![vec![1u8, 2], vec![3u8, 4], vec![5u8, 6]];
        for frame in &frames {
            h.response_tx.send(frame.clone()).await.unwrap();
        }
        // Ending the response sequence is what lets the outbound pump finish.
        drop(h.response_tx);

        // The socket stays open; only the AI side terminates the call here.
        let inbound = futures::stream::iter(vec![text(r#"{"event":"start","streamSid":"MZ7"}"#)])
            .chain(futures::stream::pending());
        let (out_tx, out_rx) = socket_pair();

        let summary = run(out_tx, inbound, &h.factory).await;

        assert!(summary.error.is_none());
        assert_eq!(summary.frames_to_caller, 3);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);

        let written = written(out_rx).await;
        assert_eq!(written.len(), 4);
        for (value, frame) in written.iter().zip(&frames) {
            assert_eq!(value["event"], "media");
            assert_eq!(
                value["media"]["payload"],
                general_purpose::STANDARD.encode(frame)
            );
        }
        assert_eq!(written[3]["event"], "mark");
        assert_eq!(written[3]["mark"]["name"], PLAYBACK_MARK);
    }

    #[tokio::test]
    async fn ai_send_failure_drains_the_call() {
        let (sent_tx, _sent_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::channel(16);
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = MockFactory {
            session: Mutex::new(Some(Box::new(MockSession {
                sent: sent_tx,
                responses: Some(response_rx),
                closed: closed.clone(),
                fail_sends: true,
            }))),
            fail_open: false,
        };
        let inbound =
            futures::stream::iter(vec![text(r#"{"event":"media","media":{"payload":"AAAA"}}"#)])
                .chain(futures::stream::pending());
        let (out_tx, _out_rx) = socket_pair();

        let summary = run(out_tx, inbound, &factory).await;

        assert!(matches!(summary.error, Some(RelayError::Session(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        drop(response_tx);
    }
}
