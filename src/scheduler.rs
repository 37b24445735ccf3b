use std::io::Read;
use std::path::Path;

use log::{debug, error, warn};
use serde::Deserialize;

use crate::select::Select;
use crate::watchdog::{Stage, Watchdog};
use crate::websocket::{Message, MessageType, State, WebSocket};

/// Everything the scheduler can say over `/compile`. Older schedulers
/// still call the builder a slave; accept both type tags.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SchedulerMessage {
    #[serde(rename = "needsEnvironment")]
    NeedsEnvironment,
    #[serde(rename = "builder", alias = "slave")]
    Builder {
        #[serde(default)]
        ip: String,
        #[serde(default)]
        hostname: Option<String>,
        port: u16,
        #[serde(default)]
        id: u64,
        #[serde(default)]
        environment: Option<String>,
        #[serde(default, rename = "extraArgs")]
        extra_args: Vec<String>,
    },
    #[serde(rename = "version_mismatch")]
    VersionMismatch {
        #[serde(default)]
        minimum_version: String,
    },
    #[serde(rename = "version_verified")]
    VersionVerified {
        #[serde(default)]
        minimum_version: String,
    },
}

/// The builder the scheduler picked for this job.
#[derive(Debug, Clone)]
pub struct BuilderInfo {
    pub ip: String,
    pub hostname: Option<String>,
    pub port: u16,
    pub id: u64,
    pub environment: Option<String>,
    pub extra_args: Vec<String>,
}

impl BuilderInfo {
    pub fn url(&self) -> String {
        let host = self.hostname.as_deref().filter(|h| !h.is_empty());
        format!(
            "ws://{}:{}/compile",
            host.unwrap_or(self.ip.as_str()),
            self.port
        )
    }
}

/// How the scheduler dialogue ended.
#[derive(Debug, Default)]
pub struct SchedulerOutcome {
    pub builder: Option<BuilderInfo>,
    pub needs_environment: bool,
    pub version_mismatch: Option<String>,
    pub version_verified: bool,
}

/// Drives the JSON dialogue after the scheduler WebSocket connects.
pub struct SchedulerSession {
    pub ws: WebSocket,
    pub done: bool,
    pub outcome: SchedulerOutcome,
    connected_seen: bool,
}

impl SchedulerSession {
    pub fn connect(url: &str, headers: &[(String, String)]) -> crate::Result<Self> {
        Ok(SchedulerSession {
            ws: WebSocket::connect(url, headers)?,
            done: false,
            outcome: SchedulerOutcome::default(),
            connected_seen: false,
        })
    }

    /// True while the socket is still making progress and no terminal
    /// message has arrived.
    pub fn running(&self) -> bool {
        !self.done && self.ws.state() >= State::None
    }

    /// Drains decoded messages after a reactor pass.
    pub fn poll(&mut self, watchdog: &Watchdog) {
        if !self.connected_seen && self.ws.state() == State::ConnectedWebSocket {
            self.connected_seen = true;
            watchdog.transition(Stage::ConnectedToScheduler);
        }
        while let Some(message) = self.ws.take_message() {
            self.handle(message);
            if self.done {
                break;
            }
        }
    }

    fn handle(&mut self, message: Message) {
        if message.kind != MessageType::Text {
            warn!("Unexpected binary message from scheduler ({} bytes)", message.payload.len());
            return;
        }
        let parsed: SchedulerMessage = match serde_json::from_slice(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Failed to parse scheduler message: {e}");
                self.done = true;
                return;
            }
        };
        debug!("Scheduler message: {parsed:?}");
        match parsed {
            SchedulerMessage::NeedsEnvironment => {
                self.outcome.needs_environment = true;
                self.done = true;
            }
            SchedulerMessage::Builder {
                ip,
                hostname,
                port,
                id,
                environment,
                extra_args,
            } => {
                self.outcome.builder = Some(BuilderInfo {
                    ip,
                    hostname,
                    port,
                    id,
                    environment,
                    extra_args,
                });
                self.done = true;
            }
            SchedulerMessage::VersionMismatch { minimum_version } => {
                self.outcome.version_mismatch = Some(minimum_version);
                self.done = true;
            }
            SchedulerMessage::VersionVerified { .. } => {
                self.outcome.version_verified = true;
                self.done = true;
            }
        }
    }

    /// Streams the environment tarball to the scheduler on the existing
    /// connection: one JSON announcement, then binary chunks adding up to
    /// exactly the announced size.
    pub fn upload_environment(
        &mut self,
        select: &Select,
        hash: &str,
        tarball: &Path,
    ) -> crate::Result<()> {
        let size = std::fs::metadata(tarball)?.len();
        let announce = serde_json::json!({
            "type": "uploadEnvironment",
            "hash": hash,
            "bytes": size,
        });
        self.ws
            .send(MessageType::Text, announce.to_string().as_bytes());

        let mut file = std::fs::File::open(tarball)?;
        let mut chunk = vec![0u8; 256 * 1024];
        let mut sent = 0u64;
        while sent < size {
            let want = std::cmp::min((size - sent) as usize, chunk.len());
            file.read_exact(&mut chunk[..want])?;
            self.ws.send(MessageType::Binary, &chunk[..want]);
            sent += want as u64;
            debug!("Uploading environment: {sent}/{size} bytes");
            while self.ws.has_pending_send() && self.ws.state() == State::ConnectedWebSocket {
                select.exec(&mut [&mut self.ws], None)?;
            }
            if self.ws.state() != State::ConnectedWebSocket {
                return Err(crate::Error::from("scheduler connection lost during upload"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_message_parses() {
        let msg: SchedulerMessage = serde_json::from_str(
            r#"{"type":"builder","ip":"10.0.0.5","port":8080,"id":42}"#,
        )
        .unwrap();
        match msg {
            SchedulerMessage::Builder { ip, port, id, hostname, .. } => {
                assert_eq!(ip, "10.0.0.5");
                assert_eq!(port, 8080);
                assert_eq!(id, 42);
                assert!(hostname.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn legacy_slave_tag_is_accepted() {
        let msg: SchedulerMessage = serde_json::from_str(
            r#"{"type":"slave","ip":"10.0.0.9","port":8097,"id":1}"#,
        )
        .unwrap();
        assert!(matches!(msg, SchedulerMessage::Builder { .. }));
    }

    #[test]
    fn needs_environment_and_version_messages_parse() {
        assert_eq!(
            serde_json::from_str::<SchedulerMessage>(r#"{"type":"needsEnvironment"}"#).unwrap(),
            SchedulerMessage::NeedsEnvironment
        );
        let msg: SchedulerMessage =
            serde_json::from_str(r#"{"type":"version_mismatch","minimum_version":"3.0.1"}"#)
                .unwrap();
        assert_eq!(
            msg,
            SchedulerMessage::VersionMismatch {
                minimum_version: "3.0.1".to_string()
            }
        );
    }

    #[test]
    fn hostname_takes_precedence_over_ip() {
        let with_hostname = BuilderInfo {
            ip: "10.0.0.5".to_string(),
            hostname: Some("builder1.example.com".to_string()),
            port: 8080,
            id: 42,
            environment: None,
            extra_args: Vec::new(),
        };
        assert_eq!(with_hostname.url(), "ws://builder1.example.com:8080/compile");

        let ip_only = BuilderInfo {
            hostname: None,
            ..with_hostname
        };
        assert_eq!(ip_only.url(), "ws://10.0.0.5:8080/compile");
    }
}
