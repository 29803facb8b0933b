//! Speech recognition capability
//!
//! A [`SpeechSource`] delivers transcripts and lifecycle signals through a
//! [`SourceEvents`] handle. The handle only enqueues; all state changes
//! happen on the state machine's event loop.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a source could not be started
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("Speech recognition is not supported on this platform")]
    Unsupported,

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Speech recognition failed to start: {0}")]
    Failed(String),
}

/// Runtime recognition error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechErrorKind {
    PermissionDenied,
    Transient,
    Other,
}

/// Signals emitted by a running source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSignal {
    Started,
    Transcript(String),
    Ended,
    Error(SpeechErrorKind),
}

/// Enqueue-only handle given to a source on start
#[derive(Clone)]
pub struct SourceEvents {
    enqueue: Arc<dyn Fn(SourceSignal) -> bool + Send + Sync>,
}

impl SourceEvents {
    /// Build a handle from an enqueue function; it returns false once the
    /// receiving side is gone
    pub fn new<F>(enqueue: F) -> Self
    where
        F: Fn(SourceSignal) -> bool + Send + Sync + 'static,
    {
        Self {
            enqueue: Arc::new(enqueue),
        }
    }

    /// Handle backed by an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SourceSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(move |signal| tx.send(signal).is_ok()), rx)
    }

    pub fn started(&self) -> bool {
        (self.enqueue)(SourceSignal::Started)
    }

    pub fn transcript(&self, text: impl Into<String>) -> bool {
        (self.enqueue)(SourceSignal::Transcript(text.into()))
    }

    pub fn ended(&self) -> bool {
        (self.enqueue)(SourceSignal::Ended)
    }

    pub fn error(&self, kind: SpeechErrorKind) -> bool {
        (self.enqueue)(SourceSignal::Error(kind))
    }
}

/// Continuous speech recognizer
#[async_trait]
pub trait SpeechSource: Send {
    /// Begin recognition, reporting through `events`
    async fn start(&mut self, events: SourceEvents) -> Result<(), SpeechError>;

    /// Stop recognition; safe to call when not running
    async fn stop(&mut self);
}

/// Source fed by text lines over a channel
///
/// Each line is reported as one transcript. When the channel closes the
/// source reports `Ended`.
pub struct ChannelSpeechSource {
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ChannelSpeechSource {
    pub fn new(lines: mpsc::Receiver<String>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines)),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(_, task)| !task.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SpeechSource for ChannelSpeechSource {
    async fn start(&mut self, events: SourceEvents) -> Result<(), SpeechError> {
        if self.running.is_some() {
            debug!("Speech source restarting with a new event handle");
            self.stop().await;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let lines = self.lines.clone();

        let task = tokio::spawn(async move {
            events.started();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    line = async { lines.lock().await.recv().await } => line,
                };

                match next {
                    Some(line) => {
                        events.transcript(line);
                    }
                    None => {
                        debug!("Transcript channel closed");
                        break;
                    }
                }
            }

            events.ended();
        });

        self.running = Some((token, task));
        info!("Speech source started");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some((token, task)) = self.running.take() {
            token.cancel();
            if let Err(e) = task.await {
                warn!("Speech source task ended abnormally: {}", e);
            }
            info!("Speech source stopped");
        }
    }
}
