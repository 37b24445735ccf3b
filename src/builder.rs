use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};

use log::{debug, error, warn};
use serde::Deserialize;

use crate::watchdog::Watchdog;
use crate::websocket::{Message, MessageType, State, WebSocket};

/// stderr fragments that mean the builder box itself is broken; the
/// failure is not the code's fault and the job is retried locally.
const SUSPICIOUS_ERRORS: &[&str] = &[
    "unable to rename temporary ",
    "execvp: No such file or directory",
    "cannot execute ",
    "cannot open ",
    "internal compiler error",
    "error trying to exec",
];

#[derive(Debug, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    #[serde(default)]
    pub bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BuilderMessage {
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "stdout")]
    Stdout {
        #[serde(default)]
        data: String,
    },
    #[serde(rename = "stderr")]
    Stderr {
        #[serde(default)]
        data: String,
    },
    #[serde(rename = "response")]
    Response {
        #[serde(default)]
        success: bool,
        #[serde(default, rename = "exitCode")]
        exit_code: i32,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        index: Vec<IndexEntry>,
        #[serde(default, rename = "objectCache")]
        object_cache: bool,
    },
}

struct FileEntry {
    path: String,
    bytes: u64,
}

/// Drives the JSON+binary dialogue with the builder: header, optional
/// wait-mode pause, body upload, then the declared file stream.
pub struct BuilderSession {
    pub ws: WebSocket,
    pub done: bool,
    /// Holding the body until the builder says resume.
    pub wait: bool,
    pub exit_code: i32,
    pub error: Option<&'static str>,
    pub object_cache: bool,
    pub total_written: u64,
    /// Set when the builder failed and the preprocessed source should be
    /// kept for postmortem.
    pub dump_preprocessed_error: bool,
    files: VecDeque<FileEntry>,
    compress: bool,
    source_file: String,
    cpp_stderr: Vec<u8>,
}

impl BuilderSession {
    pub fn connect(
        url: &str,
        headers: &[(String, String)],
        compress: bool,
        source_file: String,
    ) -> crate::Result<Self> {
        Ok(BuilderSession {
            ws: WebSocket::connect(url, headers)?,
            done: false,
            wait: false,
            exit_code: 0,
            error: None,
            object_cache: false,
            total_written: 0,
            dump_preprocessed_error: false,
            files: VecDeque::new(),
            compress,
            source_file,
            cpp_stderr: Vec::new(),
        })
    }

    /// Preprocessor diagnostics replayed ahead of the builder's own output.
    pub fn set_preprocessed_stderr(&mut self, stderr: &[u8]) {
        self.cpp_stderr = stderr.to_vec();
    }

    pub fn running(&self) -> bool {
        !self.done && self.ws.state() == State::ConnectedWebSocket
    }

    pub fn poll(&mut self, watchdog: &Watchdog) {
        while let Some(message) = self.ws.take_message() {
            match message.kind {
                MessageType::Text => self.handle_text(message, watchdog),
                MessageType::Binary => self.handle_file_contents(&message.payload),
            }
            if self.done {
                break;
            }
        }
    }

    fn protocol_error(&mut self, reason: &'static str) {
        error!("{reason}");
        self.error = Some(reason);
        self.done = true;
    }

    fn handle_text(&mut self, message: Message, watchdog: &Watchdog) {
        let parsed: BuilderMessage = match serde_json::from_slice(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Failed to parse builder message: {e}");
                self.protocol_error("builder json parse error");
                return;
            }
        };
        match parsed {
            BuilderMessage::Resume => {
                debug!("Builder resumed us, uploading the body");
                self.wait = false;
            }
            BuilderMessage::Heartbeat => {
                debug!("Builder heartbeat");
                watchdog.heartbeat();
            }
            BuilderMessage::Stdout { data } => {
                let _ = std::io::stdout().write_all(data.as_bytes());
            }
            BuilderMessage::Stderr { data } => {
                let _ = std::io::stderr().write_all(data.as_bytes());
            }
            BuilderMessage::Response {
                success,
                exit_code,
                stdout,
                stderr,
                index,
                object_cache,
            } => self.handle_response(success, exit_code, stdout, stderr, index, object_cache),
        }
    }

    fn handle_response(
        &mut self,
        success: bool,
        exit_code: i32,
        stdout: String,
        stderr: String,
        index: Vec<IndexEntry>,
        object_cache: bool,
    ) {
        if !success {
            error!("Builder reported failure, building locally");
            self.protocol_error("builder run failure");
            return;
        }
        self.exit_code = exit_code;
        self.object_cache = object_cache;

        if exit_code != 0 {
            let haystack = if stderr.len() < 128 * 1024 {
                uncolor(&stderr)
            } else {
                stderr.clone()
            };
            if haystack.is_empty()
                || SUSPICIOUS_ERRORS.iter().any(|s| haystack.contains(s))
            {
                error!(
                    "Builder {} had a suspicious error, building locally:\n{}",
                    self.ws.url(),
                    stderr
                );
                self.protocol_error("suspicious builder error");
                return;
            }
            self.dump_preprocessed_error = true;
            eprintln!(
                "error: exit code: {} fisk builder: {} source file: {} fisk-version: {}",
                exit_code,
                self.ws.url(),
                self.source_file,
                crate::VERSION
            );
        }

        if !self.cpp_stderr.is_empty() {
            let _ = std::io::stderr().write_all(&self.cpp_stderr);
        }
        if !stdout.is_empty() {
            let _ = std::io::stdout().write_all(stdout.as_bytes());
        }
        if !stderr.is_empty() {
            let _ = std::io::stderr().write_all(stderr.as_bytes());
        }

        for entry in index {
            if entry.path.is_empty() {
                self.protocol_error("builder sent a file with no path");
                return;
            }
            self.total_written += entry.bytes;
            if entry.bytes == 0 {
                // declared but empty: touch it, no frame follows
                if let Err(e) = File::create(&entry.path) {
                    error!("Can't create {}: {e}", entry.path);
                    self.protocol_error("builder file open error");
                    return;
                }
            } else {
                self.files.push_back(FileEntry {
                    path: entry.path,
                    bytes: entry.bytes,
                });
            }
        }
        self.done = self.files.is_empty();
    }

    fn handle_file_contents(&mut self, data: &[u8]) {
        debug!("Binary frame of {} bytes", data.len());
        let Some(front) = self.files.front() else {
            warn!("Unexpected binary frame ({} bytes)", data.len());
            self.protocol_error("builder protocol error");
            return;
        };
        if data.len() as u64 != front.bytes {
            error!(
                "Bad file data for {}: expected {} bytes, got {}",
                front.path,
                front.bytes,
                data.len()
            );
            self.protocol_error("builder file data error");
            return;
        }
        let result = if self.compress {
            write_inflated(&front.path, data)
        } else {
            File::create(&front.path).and_then(|mut f| f.write_all(data))
        };
        if let Err(e) = result {
            error!("Failed to write {}: {e}", front.path);
            self.protocol_error("builder file write error");
            return;
        }
        debug!("Wrote {}", front.path);
        self.files.pop_front();
        self.done = self.files.is_empty();
    }
}

fn write_inflated(path: &str, data: &[u8]) -> std::io::Result<()> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut contents = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut contents)?;
    File::create(path)?.write_all(&contents)
}

/// Strips ANSI escape sequences so the suspicious-substring scan sees the
/// compiler's words, not its colors.
pub fn uncolor(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_with_index() {
        let msg: BuilderMessage = serde_json::from_str(
            r#"{"type":"response","success":true,"exitCode":0,"stdout":"","stderr":"","index":[{"path":"foo.o","bytes":1024}]}"#,
        )
        .unwrap();
        match msg {
            BuilderMessage::Response {
                success,
                exit_code,
                index,
                ..
            } => {
                assert!(success);
                assert_eq!(exit_code, 0);
                assert_eq!(index.len(), 1);
                assert_eq!(index[0].path, "foo.o");
                assert_eq!(index[0].bytes, 1024);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn resume_and_heartbeat_parse() {
        assert!(matches!(
            serde_json::from_str::<BuilderMessage>(r#"{"type":"resume"}"#).unwrap(),
            BuilderMessage::Resume
        ));
        assert!(matches!(
            serde_json::from_str::<BuilderMessage>(r#"{"type":"heartbeat"}"#).unwrap(),
            BuilderMessage::Heartbeat
        ));
    }

    #[test]
    fn uncolor_strips_csi_sequences() {
        assert_eq!(
            uncolor("\x1b[1m\x1b[31merror:\x1b[0m boom"),
            "error: boom"
        );
        assert_eq!(uncolor("plain text"), "plain text");
        // unterminated sequence consumes the remainder quietly
        assert_eq!(uncolor("x\x1b[12"), "x");
    }

    #[test]
    fn suspicious_errors_match_through_color() {
        let stderr = "\x1b[31minternal compiler error\x1b[0m: in foo()";
        let cleaned = uncolor(stderr);
        assert!(SUSPICIOUS_ERRORS.iter().any(|s| cleaned.contains(s)));
    }

    #[test]
    fn honest_compile_error_is_not_suspicious() {
        let stderr = "foo.c:3:5: error: unknown type name 'foo'";
        assert!(!SUSPICIOUS_ERRORS.iter().any(|s| stderr.contains(s)));
        assert!(!stderr.is_empty());
    }
}
