//! Demo device client.
//!
//! Registers with an orchestrator, announces one task (optionally an image
//! file, base64-encoded), and reports every message it gets back. With
//! `answer_bids` set it also bids on every request it receives, so a single
//! client can drive a whole round on its own.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use fleetbid_protocol::{MessageFramer, MessageKind, WireMessage, DEFAULT_PORT};

#[derive(Debug, Clone)]
pub struct DemoClientOptions {
    pub addr: String,
    pub device_id: String,
    pub capabilities: Vec<String>,
    pub has_npu: bool,
    pub cpu_load: f64,
    pub battery: f64,
    /// Capability the announced task requires.
    pub capability: Option<String>,
    /// Image to send; a small text payload is sent when absent.
    pub image: Option<PathBuf>,
    pub answer_bids: bool,
    /// Stop after this long without a new message.
    pub idle_timeout: Duration,
}

impl Default for DemoClientOptions {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            device_id: "demo-device".to_string(),
            capabilities: vec!["classify".to_string()],
            has_npu: false,
            cpu_load: 0.3,
            battery: 85.0,
            capability: None,
            image: None,
            answer_bids: false,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl DemoClientOptions {
    fn register_message(&self) -> WireMessage {
        WireMessage::new(
            MessageKind::Register,
            &self.device_id,
            "",
            "",
            json!({
                "deviceId": self.device_id,
                "has_npu": self.has_npu,
                "capabilities": self.capabilities,
                "metrics": { "cpu_load": self.cpu_load, "battery": self.battery },
            }),
        )
    }

    fn task_message(&self) -> anyhow::Result<WireMessage> {
        let subtask = self.capability.as_deref().unwrap_or("");
        match &self.image {
            Some(path) => {
                let bytes = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
                tracing::info!(path = %path.display(), bytes = bytes.len(), "sending image");
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                Ok(WireMessage::new(
                    MessageKind::TaskSource,
                    &self.device_id,
                    "",
                    subtask,
                    json!({ "image_base64": encoded }),
                ))
            }
            None => Ok(WireMessage::new(
                MessageKind::TaskSource,
                &self.device_id,
                "",
                subtask,
                json!({ "payload": { "text": "hello from the demo client" } }),
            )),
        }
    }

    fn bid_message(&self, task_id: &str) -> WireMessage {
        WireMessage::new(
            MessageKind::Bid,
            &self.device_id,
            task_id,
            "",
            json!({
                "metrics": {
                    "cpu_load": self.cpu_load,
                    "battery": self.battery,
                    "has_npu": self.has_npu,
                    "timestamp": chrono::Utc::now().timestamp(),
                }
            }),
        )
    }
}

/// Run the demo and return every message received, in order. Stops at the
/// first task or task failure, when the orchestrator hangs up, or after
/// `idle_timeout` of silence.
pub async fn run_demo_client(options: &DemoClientOptions) -> anyhow::Result<Vec<WireMessage>> {
    let mut stream = TcpStream::connect(&options.addr)
        .await
        .with_context(|| format!("connecting to {}", options.addr))?;
    tracing::info!(addr = %options.addr, device_id = %options.device_id, "connected");

    send(&mut stream, &options.register_message()).await?;
    send(&mut stream, &options.task_message()?).await?;

    let mut framer = MessageFramer::default();
    let mut received = Vec::new();

    loop {
        let read = tokio::time::timeout(options.idle_timeout, stream.read_buf(framer.buffer_mut())).await;
        let n = match read {
            Ok(result) => result?,
            Err(_) => {
                tracing::info!(secs = options.idle_timeout.as_secs_f64(), "no traffic, stopping");
                break;
            }
        };
        if n == 0 {
            tracing::info!("orchestrator closed the connection");
            break;
        }

        while let Some(message) = framer.next_message()? {
            tracing::info!(kind = %message.kind, task_id = %message.task_id, "received");
            let kind = message.message_kind();
            if options.answer_bids && kind == Some(MessageKind::BidRequest) {
                send(&mut stream, &options.bid_message(&message.task_id)).await?;
            }
            let done = matches!(kind, Some(MessageKind::Task) | Some(MessageKind::TaskFailed));
            received.push(message);
            if done {
                return Ok(received);
            }
        }
    }

    Ok(received)
}

async fn send(stream: &mut TcpStream, message: &WireMessage) -> anyhow::Result<()> {
    stream.write_all(&message.to_bytes()?).await?;
    Ok(())
}
