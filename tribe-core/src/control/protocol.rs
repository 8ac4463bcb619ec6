//! Line protocol spoken on the engine control connection.
//!
//! ```text
//! client: SUPPORTS <capabilities>
//! client: START <asset>
//! engine: PLAY <data url>      or      ERROR <anything>
//! client: SHUTDOWN
//! ```
//!
//! Lines end in CRLF. A bare LF is tolerated on input.

/// One control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDirective {
    Supports(String),
    Start(String),
    Play(String),
    Error(String),
    Shutdown,
    /// Anything else. Ignored by both ends.
    Unknown(String),
}

impl ControlDirective {
    /// Classifies a line with its terminator already removed.
    ///
    /// Engine replies are matched on prefix: `PLAY` carries the data URL from
    /// the sixth character on, and any line starting with `ERROR` is an error.
    pub fn parse(line: &str) -> Self {
        if line.starts_with("PLAY") {
            return ControlDirective::Play(line.get(5..).unwrap_or_default().trim().to_string());
        }
        if let Some(rest) = line.strip_prefix("ERROR") {
            return ControlDirective::Error(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix("SUPPORTS ") {
            return ControlDirective::Supports(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("START ") {
            return ControlDirective::Start(rest.to_string());
        }
        if line == "SHUTDOWN" {
            return ControlDirective::Shutdown;
        }
        ControlDirective::Unknown(line.to_string())
    }

    /// Wire form including the CRLF terminator.
    pub fn encode(&self) -> String {
        match self {
            ControlDirective::Supports(capabilities) => format!("SUPPORTS {capabilities}\r\n"),
            ControlDirective::Start(asset) => format!("START {asset}\r\n"),
            ControlDirective::Play(url) => format!("PLAY {url}\r\n"),
            ControlDirective::Error(message) if message.is_empty() => "ERROR\r\n".to_string(),
            ControlDirective::Error(message) => format!("ERROR {message}\r\n"),
            ControlDirective::Shutdown => "SHUTDOWN\r\n".to_string(),
            ControlDirective::Unknown(line) => format!("{line}\r\n"),
        }
    }
}

/// Builds the opening message: capability announcement followed by the start
/// directive, written in one go.
pub fn handshake(capabilities: &str, asset: &str) -> String {
    let mut message = ControlDirective::Supports(capabilities.to_string()).encode();
    message.push_str(&ControlDirective::Start(asset.to_string()).encode());
    message
}

/// Splits a byte stream into lines across arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Unterminated remainder left when the stream ends, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
        (!line.is_empty()).then_some(line)
    }
}
