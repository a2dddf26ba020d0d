use crate::agent::{HealthSnapshot, ModeController};
use crate::config::GatewayConfig;
use crate::error::{BrainError, GatewayError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const MAX_REQUEST_BYTES: usize = 65_536;

/// Seam between the wire listener and the agent, so the protocol handling
/// is testable without a full controller.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn handle_prompt(&self, prompt: &str) -> Result<String, BrainError>;
    async fn health(&self) -> HealthSnapshot;
}

#[async_trait]
impl PromptHandler for ModeController {
    async fn handle_prompt(&self, prompt: &str) -> Result<String, BrainError> {
        ModeController::handle_prompt(self, prompt).await
    }

    async fn health(&self) -> HealthSnapshot {
        ModeController::health(self).await
    }
}

#[derive(Deserialize)]
struct PromptRequest {
    #[serde(default)]
    prompt: String,
}

/// Bind the invocation listener, probing successive ports on EADDRINUSE.
pub async fn bind(config: &GatewayConfig) -> Result<(TcpListener, u16), GatewayError> {
    let attempts = config.bind_attempts.max(1);
    let mut port = config.port;
    let mut last_error = None;

    for _ in 0..attempts {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => {
                tracing::info!(host = config.host.as_str(), port, "invocation gateway listening");
                return Ok((listener, port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                last_error = Some(e);
                port = port.wrapping_add(1);
            }
            Err(e) => return Err(GatewayError::Bind(e.to_string(), 1)),
        }
    }

    Err(GatewayError::Bind(
        last_error.map(|e| e.to_string()).unwrap_or_default(),
        attempts,
    ))
}

/// Accept loop. Each connection is one request/response exchange.
pub async fn serve(
    handler: Arc<dyn PromptHandler>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "gateway connection");
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(error) = handle_connection(handler, stream).await {
                            tracing::warn!(%error, "gateway connection failed");
                        }
                    });
                }
                Err(error) => tracing::warn!(%error, "gateway accept failed"),
            },
        }
    }
}

async fn handle_connection(
    handler: Arc<dyn PromptHandler>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    let mut buffer = vec![0_u8; MAX_REQUEST_BYTES];
    let read = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..read]).trim().to_string();

    let response = respond(handler.as_ref(), &request).await;
    stream.write_all(response.to_string().as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

async fn respond(handler: &dyn PromptHandler, request: &str) -> serde_json::Value {
    if request == "HEALTH" || request.starts_with("GET /health") {
        return match serde_json::to_value(handler.health().await) {
            Ok(health) => health,
            Err(e) => json!({ "error": e.to_string() }),
        };
    }

    let parsed: Result<PromptRequest, _> = serde_json::from_str(request);
    match parsed {
        Ok(request) if request.prompt.trim().is_empty() => {
            tracing::warn!("invocation without prompt");
            json!({ "error": "prompt required" })
        }
        Ok(request) => match handler.handle_prompt(request.prompt.trim()).await {
            Ok(response) => json!({ "response": response }),
            Err(error) => json!({ "error": error.to_string() }),
        },
        Err(_) => json!({ "error": "invalid JSON" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubHandler {
        prompts: AtomicUsize,
    }

    #[async_trait]
    impl PromptHandler for StubHandler {
        async fn handle_prompt(&self, prompt: &str) -> Result<String, BrainError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            if prompt == "boom" {
                Err(BrainError::Request("service down".into()))
            } else {
                Ok(format!("echo: {prompt}"))
            }
        }

        async fn health(&self) -> HealthSnapshot {
            HealthSnapshot {
                status: "healthy",
                mode: "ambient",
                actuator_reachable: false,
                uptime_seconds: 12,
                actions_recorded: 3,
            }
        }
    }

    fn stub() -> StubHandler {
        StubHandler {
            prompts: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn health_probe_answers_without_engaging_brain() {
        let handler = stub();
        let response = respond(&handler, "HEALTH").await;
        assert_eq!(response["status"], "healthy");
        assert_eq!(response["mode"], "ambient");
        assert_eq!(handler.prompts.load(Ordering::SeqCst), 0);

        let response = respond(&handler, "GET /health HTTP/1.1").await;
        assert_eq!(response["uptime_seconds"], 12);
    }

    #[tokio::test]
    async fn prompt_request_round_trips() {
        let handler = stub();
        let response = respond(&handler, r#"{"prompt": "hello"}"#).await;
        assert_eq!(response["response"], "echo: hello");
    }

    #[tokio::test]
    async fn empty_prompt_is_an_error() {
        let handler = stub();
        let response = respond(&handler, r#"{"prompt": "  "}"#).await;
        assert_eq!(response["error"], "prompt required");
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let handler = stub();
        let response = respond(&handler, "definitely not json").await;
        assert_eq!(response["error"], "invalid JSON");
    }

    #[tokio::test]
    async fn handler_failure_maps_to_error_payload() {
        let handler = stub();
        let response = respond(&handler, r#"{"prompt": "boom"}"#).await;
        assert!(
            response["error"]
                .as_str()
                .unwrap()
                .contains("service down")
        );
    }

    #[tokio::test]
    async fn bind_probes_next_port_when_taken() {
        let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let config = GatewayConfig {
            host: "127.0.0.1".into(),
            port: taken,
            bind_attempts: 3,
        };
        let (_listener, port) = bind(&config).await.unwrap();
        assert_ne!(port, taken);
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            Arc::new(stub()) as Arc<dyn PromptHandler>,
            listener,
            cancel.clone(),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(br#"{"prompt": "ping"}"#)
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["response"], "echo: ping");

        cancel.cancel();
        let _ = server.await;
    }
}
