//! WebSocket STT stream.
//!
//! Wire protocol: binary frames carry 16-bit little-endian PCM; the vendor
//! answers with JSON text frames:
//!
//! ```json
//! {"type":"partial","text":"...","confidence":0.87}
//! {"type":"final","text":"...","confidence":0.93}
//! {"type":"vad","signal":"speech_start"}
//! ```
//!
//! A `{"type":"close"}` text frame asks the vendor to flush its final.
//! Transient transport errors are retried with jittered exponential
//! backoff, at most `max_reconnects` times, after which the stream fails.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use callbridge_core::{AudioFrame, TranscriptResult};

use super::{SttConfig, SttEvent, SttStream, SttVadSignal};
use crate::PipelineError;

type WsSink = futures::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Partial {
        text: String,
        #[serde(default)]
        confidence: f32,
    },
    Final {
        text: String,
        #[serde(default)]
        confidence: f32,
    },
    Vad {
        signal: String,
    },
    Error {
        message: String,
    },
}

struct Shared {
    last_partial: Mutex<Option<TranscriptResult>>,
    last_final: Mutex<Option<TranscriptResult>>,
}

/// WebSocket-backed STT stream.
pub struct WsSttStream {
    config: SttConfig,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    events: Mutex<Option<mpsc::Receiver<SttEvent>>>,
    event_tx: mpsc::Sender<SttEvent>,
    shared: Arc<Shared>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsSttStream {
    /// Open a stream, retrying transient failures.
    pub async fn connect(config: SttConfig) -> Result<Self, PipelineError> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            last_partial: Mutex::new(None),
            last_final: Mutex::new(None),
        });

        let ws = connect_with_retry(&config).await?;
        let (sink, source) = ws.split();

        let reader = tokio::spawn(read_loop(source, event_tx.clone(), shared.clone()));

        Ok(Self {
            config,
            sink: tokio::sync::Mutex::new(Some(sink)),
            events: Mutex::new(Some(event_rx)),
            event_tx,
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Open and immediately close a stream to warm DNS/TLS/session state.
    pub async fn prewarm(config: &SttConfig) -> Result<(), PipelineError> {
        let mut ws = connect_with_retry(config).await?;
        let _ = ws.close(None).await;
        Ok(())
    }
}

#[async_trait]
impl SttStream for WsSttStream {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), PipelineError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(PipelineError::StreamClosed)?;
        let payload = frame.to_pcm16();

        if let Err(e) = sink.send(Message::Binary(payload.clone())).await {
            tracing::warn!(error = %e, "STT send failed, reconnecting");
            // Replace the transport and retry the frame once.
            let ws = connect_with_retry(&self.config).await?;
            let (new_sink, source) = ws.split();
            *sink = new_sink;
            if let Some(old) = self.reader.lock().take() {
                old.abort();
            }
            *self.reader.lock() = Some(tokio::spawn(read_loop(
                source,
                self.event_tx.clone(),
                self.shared.clone(),
            )));
            sink.send(Message::Binary(payload))
                .await
                .map_err(|e| PipelineError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SttEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<Option<TranscriptResult>, PipelineError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Text(r#"{"type":"close"}"#.into())).await;
            let _ = sink.close().await;
        }

        // Wait briefly for the vendor's flushed final to land.
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = tokio::time::timeout(Duration::from_millis(1500), reader).await;
        }

        if let Some(final_result) = self.shared.last_final.lock().take() {
            return Ok(Some(final_result));
        }
        // Interrupted before a final: the last non-empty partial stands.
        Ok(self
            .shared
            .last_partial
            .lock()
            .take()
            .filter(|t| !t.text.is_empty())
            .map(|mut t| {
                t.is_final = true;
                t
            }))
    }
}

async fn connect_with_retry(
    config: &SttConfig,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, PipelineError> {
    let url = format!(
        "{}?model={}&language={}&sample_rate={}&encoding=pcm16",
        config.endpoint,
        config.model,
        config.language.code(),
        config.sample_rate
    );

    let mut backoff = Duration::from_millis(config.initial_backoff_ms);
    let mut attempt = 0u32;
    loop {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        if !config.api_key.is_empty() {
            let value = format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|_| PipelineError::Transport("bad api key header".into()))?;
            request.headers_mut().insert("authorization", value);
        }

        match connect_async(request).await {
            Ok((ws, _response)) => return Ok(ws),
            Err(e) => {
                attempt += 1;
                if attempt > config.max_reconnects {
                    return Err(PipelineError::Transport(format!(
                        "STT connect failed after {} attempts: {e}",
                        attempt
                    )));
                }
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                let wait = backoff + Duration::from_millis(jitter);
                tracing::warn!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "STT connect failed, backing off"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
}

async fn read_loop(
    mut source: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    event_tx: mpsc::Sender<SttEvent>,
    shared: Arc<Shared>,
) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<WireEvent>(&text) {
                Ok(WireEvent::Partial { text, confidence }) => {
                    let result = TranscriptResult::partial(&text, confidence);
                    *shared.last_partial.lock() = Some(result);
                    if event_tx
                        .send(SttEvent::Partial { text, confidence })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(WireEvent::Final { text, confidence }) => {
                    let result = TranscriptResult::final_result(&text, confidence);
                    *shared.last_final.lock() = Some(result);
                    if event_tx
                        .send(SttEvent::Final { text, confidence })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(WireEvent::Vad { signal }) => {
                    let signal = match signal.as_str() {
                        "speech_start" => Some(SttVadSignal::SpeechStart),
                        "speech_end" => Some(SttVadSignal::SpeechEnd),
                        other => {
                            tracing::debug!(signal = other, "Unknown STT VAD signal");
                            None
                        }
                    };
                    if let Some(signal) = signal {
                        if event_tx.send(SttEvent::VadSignal(signal)).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(WireEvent::Error { message }) => {
                    let _ = event_tx.send(SttEvent::Error(message)).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Unparseable STT event");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = event_tx.send(SttEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    let _ = event_tx.send(SttEvent::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_events_parse() {
        let partial: WireEvent =
            serde_json::from_str(r#"{"type":"partial","text":"hel","confidence":0.6}"#).unwrap();
        assert!(matches!(partial, WireEvent::Partial { .. }));

        let vad: WireEvent =
            serde_json::from_str(r#"{"type":"vad","signal":"speech_end"}"#).unwrap();
        assert!(matches!(vad, WireEvent::Vad { .. }));

        let missing_confidence: WireEvent =
            serde_json::from_str(r#"{"type":"final","text":"done"}"#).unwrap();
        match missing_confidence {
            WireEvent::Final { confidence, .. } => assert_eq!(confidence, 0.0),
            _ => panic!("expected final"),
        }
    }
}
