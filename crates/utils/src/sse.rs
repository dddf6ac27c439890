/// A single frame of a `text/event-stream` response: an optional event name
/// plus a textual payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// An unnamed frame, delivered to clients as the default `message` event.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> String {
        sse_format(&self.data, self.event.as_deref())
    }
}

/// Encodes a payload as a server-sent event block.
///
/// Multiline payloads are split into one `data:` line per payload line so
/// clients parsing the wire format literally do not drop everything after the
/// first newline. An empty payload still produces a single empty `data:` line.
pub fn sse_format(data: &str, event: Option<&str>) -> String {
    let mut msg = String::new();
    if let Some(event) = event {
        msg.push_str("event: ");
        msg.push_str(event);
        msg.push('\n');
    }
    let mut wrote_data = false;
    for line in data.lines() {
        msg.push_str("data: ");
        msg.push_str(line);
        msg.push('\n');
        wrote_data = true;
    }
    if !wrote_data {
        msg.push_str("data: \n");
    }
    msg.push('\n');
    msg
}
