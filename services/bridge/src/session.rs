//! Abstraction over the provider-side speech session.
//!
//! The relay talks to the AI through these traits so that the backing
//! provider can be swapped (or mocked in tests) without touching the pump
//! logic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Raw linear PCM audio bytes. Ownership transfers along the pipeline; no
/// frame is retained after being forwarded.
pub type AudioFrame = Vec<u8>;

/// A live speech session: audio in, synthesized audio out.
#[async_trait]
pub trait AiSession: Send {
    /// Queues caller audio for the model to consume. May block under
    /// transport backpressure; never drops frames silently.
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<()>;

    /// Takes the response-audio receiver: an order-preserving,
    /// single-consumption sequence that terminates when the provider ends
    /// the session. A second call fails.
    fn responses(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Releases provider resources. Idempotent, safe after partial failure.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions; one per call.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn AiSession>>;
}

/// Production factory backed by the Gemini Live client.
pub struct GeminiLive {
    config: gemini_live::Config,
}

impl GeminiLive {
    pub fn new(config: gemini_live::Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for GeminiLive {
    async fn open(&self) -> Result<Box<dyn AiSession>> {
        let session = gemini_live::connect(&self.config)
            .await
            .context("Failed to open Gemini Live session")?;
        Ok(Box::new(GeminiLiveSession { inner: session }))
    }
}

/// Adapter implementing the generic session trait for `gemini_live::Session`.
struct GeminiLiveSession {
    inner: gemini_live::Session,
}

#[async_trait]
impl AiSession for GeminiLiveSession {
    async fn send_audio(&mut self, frame: AudioFrame) -> Result<()> {
        self.inner.send_audio(&frame).await
    }

    fn responses(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        self.inner.responses()
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}
