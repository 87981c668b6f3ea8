//! Event consumer connection.
//!
//! Events are written to a Unix stream socket as blocks of `key=value`
//! lines terminated by an empty line. The consumer answers authorizations
//! with a block carrying `eventid=<id>` and `result=<verdict>`.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::{component_debug, component_info, component_warn};

/// Writing half of the consumer connection
pub struct EventSocket {
    writer: Option<OwnedWriteHalf>,
}

/// Encode one event block
pub fn format_event(id: Option<u32>, name: &str, fields: &[(String, String)]) -> String {
    let mut block = String::new();
    if let Some(id) = id {
        block.push_str(&format!("eventid={}\n", id));
    }
    block.push_str(&format!("event={}\n", name));
    for (key, value) in fields {
        block.push_str(&format!("{}={}\n", key, value));
    }
    block.push('\n');
    block
}

/// Decode a reply block into its event id and verdict
pub fn parse_reply(lines: &[String]) -> Option<(u32, String)> {
    let mut id = None;
    let mut result = None;
    for line in lines {
        match line.split_once('=') {
            Some(("eventid", value)) => id = value.trim().parse().ok(),
            Some(("result", value)) => result = Some(value.trim().to_string()),
            _ => {}
        }
    }
    Some((id?, result?))
}

impl EventSocket {
    /// Connect to the consumer; replies are forwarded to `replies`
    pub async fn connect(path: &Path, replies: mpsc::UnboundedSender<(u32, String)>) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to event socket {:?}", path))?;
        let (reader, writer) = stream.into_split();
        component_info!("event", "Connected to event consumer at {:?}", path);

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut block = Vec::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.is_empty() => {
                        match parse_reply(&block) {
                            Some(reply) => {
                                if replies.send(reply).is_err() {
                                    break;
                                }
                            }
                            None => component_debug!("event", "Ignoring reply block {:?}", block),
                        }
                        block.clear();
                    }
                    Ok(Some(line)) => block.push(line),
                    Ok(None) => {
                        component_warn!("event", "Event consumer closed the connection");
                        break;
                    }
                    Err(e) => {
                        component_warn!("event", "Event socket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { writer: Some(writer) })
    }

    /// Placeholder used when no consumer is configured or reachable
    pub fn disconnected() -> Self {
        Self { writer: None }
    }

    /// Send an event; dropped when not connected
    pub async fn send(&mut self, id: Option<u32>, name: &str, fields: &[(String, String)]) {
        let Some(writer) = self.writer.as_mut() else {
            component_debug!("event", "No event consumer, {} dropped", name);
            return;
        };
        let block = format_event(id, name, fields);
        if let Err(e) = writer.write_all(block.as_bytes()).await {
            component_warn!("event", "Event socket write failed: {}", e);
            self.writer = None;
        }
    }
}
