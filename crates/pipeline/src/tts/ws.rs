//! WebSocket speech synthesizer.
//!
//! One request per segment over a pooled connection: a JSON `speak` frame
//! out, binary PCM chunks back, a JSON `done` frame to finish. Connections
//! come from the warm [`ConnectionPool`]; a connection that errors
//! mid-request is marked unhealthy and replaced by the pool.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use callbridge_core::Language;

use super::SpeechSynthesizer;
use crate::pool::{ConnectionPool, PoolConfig, StreamFactory};
use crate::PipelineError;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Done,
    Error { message: String },
}

/// Dials the TTS vendor endpoint.
pub struct TtsFactory {
    endpoint: String,
    api_key: String,
}

#[async_trait]
impl StreamFactory for TtsFactory {
    type Conn = Ws;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Ws, PipelineError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        if !self.api_key.is_empty() {
            let value = format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| PipelineError::Transport("bad api key header".into()))?;
            request.headers_mut().insert("authorization", value);
        }
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        Ok(ws)
    }

    async fn probe(&self, conn: &mut Ws) -> bool {
        conn.send(Message::Ping(Vec::new())).await.is_ok()
    }
}

/// Pooled WebSocket synthesizer.
pub struct WsSynthesizer {
    pool: ConnectionPool<TtsFactory>,
    sample_rate: u32,
}

impl WsSynthesizer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        sample_rate: u32,
        pool_config: PoolConfig,
    ) -> Self {
        let factory = TtsFactory {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        };
        Self {
            pool: ConnectionPool::new(factory, pool_config),
            sample_rate,
        }
    }

    /// Fill the pool in the background.
    pub fn prewarm_connections(&self, k: usize) {
        self.pool.prewarm(k);
    }

    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl SpeechSynthesizer for WsSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        language: Language,
    ) -> Result<Vec<Vec<u8>>, PipelineError> {
        let mut conn = self.pool.acquire().await?;

        let request = json!({
            "type": "speak",
            "text": text,
            "voice": voice_id,
            "language": language.code(),
            "sample_rate": self.sample_rate,
            "encoding": "pcm16",
        });

        if let Err(e) = conn
            .get_mut()
            .send(Message::Text(request.to_string()))
            .await
        {
            conn.mark_unhealthy();
            return Err(PipelineError::Transport(e.to_string()));
        }

        let mut chunks = Vec::new();
        loop {
            match conn.get_mut().next().await {
                Some(Ok(Message::Binary(pcm))) => chunks.push(pcm),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlFrame>(&text) {
                        Ok(ControlFrame::Done) => break,
                        Ok(ControlFrame::Error { message }) => {
                            conn.mark_unhealthy();
                            return Err(PipelineError::Transport(message));
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Unparseable TTS control frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    conn.mark_unhealthy();
                    return Err(PipelineError::StreamClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    conn.mark_unhealthy();
                    return Err(PipelineError::Transport(e.to_string()));
                }
            }
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_parse() {
        assert!(matches!(
            serde_json::from_str::<ControlFrame>(r#"{"type":"done"}"#).unwrap(),
            ControlFrame::Done
        ));
        assert!(matches!(
            serde_json::from_str::<ControlFrame>(r#"{"type":"error","message":"bad voice"}"#)
                .unwrap(),
            ControlFrame::Error { .. }
        ));
    }
}
