//! Incremental decoder from raw agent output bytes to `StreamEvent`s.
//!
//! The agent's combined stdout/stderr is an unstructured text stream with
//! sentinel-prefixed JSON lines mixed in. The parser buffers bytes across
//! chunk boundaries and only ever interprets complete lines, so the event
//! sequence is invariant under how the stream happens to be chunked.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{BuildError, StreamEvent};

const CLAUDE_MESSAGE_MARKER: &str = "__CLAUDE_MESSAGE__";
const TOOL_USE_MARKER: &str = "__TOOL_USE__";
const TOOL_RESULT_MARKER: &str = "__TOOL_RESULT__";
const BUILD_ERROR_MARKER: &str = "__BUILD_ERROR__";

/// Structured step labels the agent wrapper script prints between phases.
/// The label (and any decorative glyph before it) is stripped; the free-text
/// payload is forwarded as a progress event.
const STEP_LABELS: &[&str] = &[
    "SETUP_ENV:",
    "ANALYZE_REQ:",
    "PLAN_DESIGN:",
    "INSTALL_DEPS:",
    "DEPS_DONE:",
    "START_SERVER:",
    "SERVER_READY:",
    "PREVIEW_URL:",
];

/// Internal/log-only lines that never reach the client.
const NOISE_DENYLIST: &[&str] = &[
    "npm warn",
    "npm notice",
    "npm verb",
    "deprecationwarning",
    "experimentalwarning",
    "node_modules/",
    "[vite]",
    "vite v",
    "hmr update",
    "debugger attached",
    "waiting for the debugger",
    "transforming (",
];

// Ordered alternatives, first match wins. The agent never emits these as
// structured fields, so they are scraped from its free-text logs.
static SANDBOX_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)sandbox[\s_-]?id[:=]\s*`?([A-Za-z0-9][A-Za-z0-9_-]{3,})`?").unwrap(),
        Regex::new(r"(?i)\bsandbox\s+([a-z0-9][a-z0-9-]{7,})\b").unwrap(),
    ]
});

static PREVIEW_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)preview(?:\s+url)?[:=]\s*(https?://[^\s`]+)").unwrap(),
        Regex::new(r"(?i)\b(https?://[a-z0-9-]+\.e2b\.(?:dev|app)[^\s`]*)").unwrap(),
        Regex::new(r"(?i)\b(https?://localhost:\d+[^\s`]*)").unwrap(),
    ]
});

fn first_capture(patterns: &[Regex], line: &str) -> Option<String> {
    for pattern in patterns {
        if let Some(cap) = pattern.captures(line) {
            if let Some(m) = cap.get(1) {
                return Some(m.as_str().trim_end_matches(['.', ',']).to_string());
            }
        }
    }
    None
}

/// Stateful chunk-to-event parser for one generation session.
pub struct StreamParser {
    buf: Vec<u8>,
    sandbox_id: Option<String>,
    preview_url: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            sandbox_id: None,
            preview_url: None,
        }
    }

    /// Sandbox id mined from the stream so far, if any.
    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    /// Preview URL mined from the stream so far, if any.
    pub fn preview_url(&self) -> Option<&str> {
        self.preview_url.as_deref()
    }

    /// Feed a chunk of raw output. Returns the events decoded from every
    /// line completed by this chunk; a trailing partial line stays buffered.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buf.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line_bytes[..newline.min(line_bytes.len())]);
            self.parse_line(line.trim_end_matches('\r'), &mut events);
        }
        events
    }

    /// Flush the trailing unterminated line, if any. Call once at EOF.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        let mut events = Vec::new();
        self.parse_line(line.trim_end_matches('\r'), &mut events);
        events
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        // Sentinel-prefixed structured payloads take priority over everything.
        if let Some(payload) = trimmed.strip_prefix(CLAUDE_MESSAGE_MARKER) {
            if let Some(value) = parse_marker_json(CLAUDE_MESSAGE_MARKER, payload) {
                let content = value
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                events.push(StreamEvent::ClaudeMessage { content });
            }
            return;
        }
        if let Some(payload) = trimmed.strip_prefix(TOOL_USE_MARKER) {
            if let Some(value) = parse_marker_json(TOOL_USE_MARKER, payload) {
                let name = value
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = value.get("input").cloned().unwrap_or(Value::Null);
                events.push(StreamEvent::ToolUse { name, input });
            }
            return;
        }
        if let Some(payload) = trimmed.strip_prefix(TOOL_RESULT_MARKER) {
            // Tool results are for the agent's own bookkeeping only.
            debug!(len = payload.len(), "Ignoring tool result line");
            return;
        }
        if let Some(payload) = trimmed.strip_prefix(BUILD_ERROR_MARKER) {
            if let Some(value) = parse_marker_json(BUILD_ERROR_MARKER, payload) {
                match value {
                    Value::Array(items) => {
                        for item in items {
                            if let Ok(err) = serde_json::from_value::<BuildError>(item) {
                                events.push(StreamEvent::BuildError(err));
                            }
                        }
                    }
                    single => {
                        if let Ok(err) = serde_json::from_value::<BuildError>(single) {
                            events.push(StreamEvent::BuildError(err));
                        }
                    }
                }
            }
            return;
        }

        // Structured step labels: strip the label and any decorative glyph
        // in front of it, forward the payload as progress.
        if let Some(payload) = strip_step_label(trimmed) {
            self.mine_side_channels(payload);
            if !payload.is_empty() {
                events.push(StreamEvent::progress(payload));
            }
            return;
        }

        // Everything else is a candidate progress line, subject to the
        // noise denylist.
        let lowered = trimmed.to_lowercase();
        if NOISE_DENYLIST.iter().any(|noise| lowered.contains(noise)) {
            return;
        }

        self.mine_side_channels(trimmed);
        events.push(StreamEvent::progress(trimmed));
    }

    fn mine_side_channels(&mut self, line: &str) {
        if self.sandbox_id.is_none() {
            if let Some(id) = first_capture(&SANDBOX_ID_PATTERNS, line) {
                debug!(sandbox_id = %id, "Mined sandbox id from output");
                self.sandbox_id = Some(id);
            }
        }
        if self.preview_url.is_none() {
            if let Some(url) = first_capture(&PREVIEW_URL_PATTERNS, line) {
                debug!(preview_url = %url, "Mined preview URL from output");
                self.preview_url = Some(url);
            }
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the JSON payload after a sentinel marker. Malformed payloads are
/// logged and swallowed; they must not terminate the stream.
fn parse_marker_json(marker: &str, payload: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(payload.trim()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(marker, error = %e, "Malformed JSON after sentinel marker, skipping line");
            None
        }
    }
}

/// If the line is a structured step line, return its payload with the label
/// and any leading decorative glyph removed.
fn strip_step_label(line: &str) -> Option<&str> {
    // Wrapper scripts decorate step lines with a glyph, e.g. "✓ DEPS_DONE: ok".
    let without_glyph = line.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    for label in STEP_LABELS {
        if let Some(rest) = without_glyph.strip_prefix(label) {
            return Some(rest.trim());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(raw: &str) -> Vec<StreamEvent> {
        let mut parser = StreamParser::new();
        let mut events = parser.feed(raw.as_bytes());
        events.extend(parser.finish());
        events
    }

    #[test]
    fn plain_lines_become_progress() {
        let events = parse_all("Creating project scaffold\nWiring routes\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::progress("Creating project scaffold"),
                StreamEvent::progress("Wiring routes"),
            ]
        );
    }

    #[test]
    fn claude_message_marker() {
        let events = parse_all("__CLAUDE_MESSAGE__{\"content\":\"I'll build a marketplace\"}\n");
        assert_eq!(
            events,
            vec![StreamEvent::ClaudeMessage {
                content: "I'll build a marketplace".into()
            }]
        );
    }

    #[test]
    fn tool_use_marker() {
        let events =
            parse_all("__TOOL_USE__{\"name\":\"write_file\",\"input\":{\"path\":\"src/App.jsx\"}}\n");
        match &events[0] {
            StreamEvent::ToolUse { name, input } => {
                assert_eq!(name, "write_file");
                assert_eq!(input["path"], "src/App.jsx");
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn tool_result_is_ignored() {
        assert!(parse_all("__TOOL_RESULT__{\"ok\":true}\n").is_empty());
    }

    #[test]
    fn build_error_single_and_batched() {
        let single = parse_all(
            "__BUILD_ERROR__{\"file\":\"src/App.jsx\",\"line\":3,\"message\":\"oops\"}\n",
        );
        assert_eq!(single.len(), 1);

        let batched = parse_all(
            "__BUILD_ERROR__[{\"file\":\"a.jsx\",\"message\":\"x\"},{\"file\":\"b.jsx\",\"message\":\"y\"}]\n",
        );
        assert_eq!(batched.len(), 2);
        assert!(matches!(&batched[1], StreamEvent::BuildError(e) if e.file == "b.jsx"));
    }

    #[test]
    fn malformed_marker_json_is_swallowed() {
        let raw = "__CLAUDE_MESSAGE__{not json\nNext line survives\n";
        let events = parse_all(raw);
        assert_eq!(events, vec![StreamEvent::progress("Next line survives")]);
    }

    #[test]
    fn step_labels_are_stripped() {
        let events = parse_all("SETUP_ENV: Preparing sandbox environment\n");
        assert_eq!(
            events,
            vec![StreamEvent::progress("Preparing sandbox environment")]
        );
    }

    #[test]
    fn decorative_glyph_before_label_is_stripped() {
        let events = parse_all("\u{2713} DEPS_DONE: All dependencies installed\n");
        assert_eq!(
            events,
            vec![StreamEvent::progress("All dependencies installed")]
        );
    }

    #[test]
    fn noise_lines_are_filtered() {
        let raw = "npm WARN deprecated foo@1.0.0\nInstalling dependencies\n[vite] hmr update /src/App.jsx\n";
        let events = parse_all(raw);
        assert_eq!(events, vec![StreamEvent::progress("Installing dependencies")]);
    }

    #[test]
    fn sandbox_id_mined_first_pattern_wins() {
        let mut parser = StreamParser::new();
        parser.feed(b"sandbox_id: sbx-1a2b3c4d\n");
        assert_eq!(parser.sandbox_id(), Some("sbx-1a2b3c4d"));
        // A later candidate does not overwrite the first discovery
        parser.feed(b"running in sandbox zzzzzzzzzz\n");
        assert_eq!(parser.sandbox_id(), Some("sbx-1a2b3c4d"));
    }

    #[test]
    fn preview_url_mined_from_step_line() {
        let mut parser = StreamParser::new();
        parser.feed("\u{25B8} PREVIEW_URL: https://abc123.e2b.dev\n".as_bytes());
        assert_eq!(parser.preview_url(), Some("https://abc123.e2b.dev"));
    }

    #[test]
    fn preview_url_alternatives_ordered() {
        let mut parser = StreamParser::new();
        parser.feed(b"Preview: https://first.e2b.dev and http://localhost:5173\n");
        assert_eq!(parser.preview_url(), Some("https://first.e2b.dev"));
    }

    #[test]
    fn partial_line_is_rebuffered_never_parsed() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"half a li").is_empty());
        let events = parser.feed(b"ne\n");
        assert_eq!(events, vec![StreamEvent::progress("half a line")]);
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"__CLAUDE_ME").is_empty());
        assert!(parser.feed(b"SSAGE__{\"content\":\"split\"}").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(
            events,
            vec![StreamEvent::ClaudeMessage {
                content: "split".into()
            }]
        );
    }

    #[test]
    fn chunk_boundary_invariance() {
        let raw = "SETUP_ENV: booting\n__CLAUDE_MESSAGE__{\"content\":\"plan\"}\nWriting src/App.jsx\n__BUILD_ERROR__{\"file\":\"a.jsx\",\"message\":\"m\"}\nPREVIEW_URL: https://x.e2b.dev\n";
        let expected = parse_all(raw);
        assert!(!expected.is_empty());

        let bytes = raw.as_bytes();
        for split_a in (1..bytes.len()).step_by(3) {
            for split_b in ((split_a + 1)..bytes.len()).step_by(7) {
                let mut parser = StreamParser::new();
                let mut events = parser.feed(&bytes[..split_a]);
                events.extend(parser.feed(&bytes[split_a..split_b]));
                events.extend(parser.feed(&bytes[split_b..]));
                events.extend(parser.finish());
                assert_eq!(events, expected, "split at {} and {}", split_a, split_b);
            }
        }
    }

    #[test]
    fn finish_flushes_trailing_line() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"no terminator").is_empty());
        assert_eq!(parser.finish(), vec![StreamEvent::progress("no terminator")]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn crlf_lines_are_handled() {
        let events = parse_all("Building project\r\n");
        assert_eq!(events, vec![StreamEvent::progress("Building project")]);
    }

    #[test]
    fn empty_lines_produce_nothing() {
        assert!(parse_all("\n\n  \n").is_empty());
    }
}
