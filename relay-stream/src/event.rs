use relay_types::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Invoking,
    Processing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Ok,
    Error,
}

/// Named events of a ticketed stream.
///
/// Serialized as `{"event": <name>, "data": {...}}`, which is also the shape
/// the decoder rebuilds from `event:`/`data:` line pairs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        request_id: String,
        tool: String,
    },
    Heartbeat {
        ts: u64,
    },
    Phase {
        phase: Phase,
    },
    Result {
        success: bool,
        data: Value,
        duration_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Done {
        status: DoneStatus,
    },
}

impl StreamEvent {
    pub const NAMES: [&'static str; 6] = ["start", "heartbeat", "phase", "result", "error", "done"];

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Heartbeat { .. } => "heartbeat",
            StreamEvent::Phase { .. } => "phase",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    /// JSON payload carried on the `data:` line.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    /// Rebuild an event from its wire parts. Unknown names and payloads that
    /// do not fit the named event yield `None`.
    pub fn from_parts(name: &str, data: &str) -> Option<Self> {
        if !Self::NAMES.contains(&name) {
            return None;
        }
        let data: Value = serde_json::from_str(data).ok()?;
        serde_json::from_value(json!({ "event": name, "data": data })).ok()
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            code,
            message: message.into(),
        }
    }
}

/// Incremental `text/event-stream` parser.
///
/// Feed it arbitrary chunks; it yields every complete, recognised event.
/// Comment lines (keep-alives), unknown event names and `id:`/`retry:`
/// fields are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(ev) = self.dispatch() {
                    out.push(ev);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let name = self.event.take();
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return None;
        }
        StreamEvent::from_parts(name.as_deref()?, &data.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_format() {
        let ev = StreamEvent::Phase {
            phase: Phase::Invoking,
        };
        assert_eq!(ev.to_frame(), "event: phase\ndata: {\"phase\":\"invoking\"}\n\n");

        let done = StreamEvent::Done {
            status: DoneStatus::Error,
        };
        assert_eq!(done.data(), json!({"status": "error"}));
    }

    #[test]
    fn error_event_carries_code() {
        let ev = StreamEvent::error(ErrorCode::TicketUsed, "ticket already used");
        assert_eq!(ev.name(), "error");
        assert_eq!(
            ev.data(),
            json!({"code": "ticket_used", "message": "ticket already used"})
        );
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let events = vec![
            StreamEvent::Start {
                request_id: "r1".into(),
                tool: "echo".into(),
            },
            StreamEvent::Result {
                success: true,
                data: json!({"x": 1}),
                duration_ms: 12,
            },
            StreamEvent::Done {
                status: DoneStatus::Ok,
            },
        ];
        let wire: String = events.iter().map(StreamEvent::to_frame).collect();
        let (a, b) = wire.split_at(wire.len() / 2);

        let mut dec = SseDecoder::new();
        let mut got = dec.push(a);
        got.extend(dec.push(b));
        assert_eq!(got, events);
    }

    #[test]
    fn decoder_ignores_unknown_events_and_comments() {
        let wire = ": keep-alive\n\n\
                    event: progress\ndata: {\"pct\": 40}\n\n\
                    event: heartbeat\r\ndata: {\"ts\": 7}\r\n\r\n\
                    data: {\"orphan\": true}\n\n";
        let got = SseDecoder::new().push(wire);
        assert_eq!(got, vec![StreamEvent::Heartbeat { ts: 7 }]);
    }

    #[test]
    fn from_parts_rejects_mismatched_payload() {
        assert!(StreamEvent::from_parts("done", "{\"status\": \"maybe\"}").is_none());
        assert!(StreamEvent::from_parts("done", "not json").is_none());
    }
}
