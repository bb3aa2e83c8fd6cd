//! The decoded representation of one Event Socket frame.

use std::fmt;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

// Values are percent-encoded on the wire; '%' itself must round-trip.
const WIRE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Frame classification derived from the `Content-Type` header.
///
/// The transport layer uses this to decide whether a decoded frame completes
/// a pending command future or belongs on the asynchronous event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// `auth/request` - the server is asking for the password.
    AuthRequest,
    /// `command/reply` - synchronous reply to `auth`/`bgapi`/`sendmsg`/`event`.
    CommandReply,
    /// `api/response` - reply to a blocking `api` command.
    ApiResponse,
    /// `text/event-plain` - an asynchronous event.
    EventPlain,
    /// `text/disconnect-notice` - the server is closing the link.
    DisconnectNotice,
    /// Anything else (rude-rejection banners and the like).
    Other,
}

impl ContentType {
    pub fn of(event: &Event) -> ContentType {
        match event.content_type() {
            Some("auth/request") => ContentType::AuthRequest,
            Some("command/reply") => ContentType::CommandReply,
            Some("api/response") => ContentType::ApiResponse,
            Some("text/event-plain") => ContentType::EventPlain,
            Some("text/disconnect-notice") => ContentType::DisconnectNotice,
            _ => ContentType::Other,
        }
    }
}

/// A single protocol frame: `Name: Value` headers plus an optional body.
///
/// Headers keep their arrival order so that logged frames read the way the
/// server emitted them; lookups are by name and unordered. Repeated inserts
/// of the same name replace the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Create an event carrying only an `Event-Name` header.
    pub fn with_name(name: impl Into<String>) -> Event {
        let mut event = Event::new();
        event.insert("Event-Name", name);
        event
    }

    /// Look up a header value by exact name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Insert a header, replacing any existing value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Append a continuation line to an existing header value.
    pub fn append_to(&mut self, name: &str, line: &str) {
        match self.headers.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => {
                slot.1.push('\n');
                slot.1.push_str(line);
            }
            None => self.headers.push((name.to_string(), line.to_string())),
        }
    }

    /// Iterate headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.body.is_none()
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// Append one line of body content.
    pub fn append_body(&mut self, line: &str) {
        match self.body.as_mut() {
            Some(body) => {
                body.push('\n');
                body.push_str(line);
            }
            None => self.body = Some(line.to_string()),
        }
    }

    /// Fold another event's headers and body into this one.
    pub fn merge(&mut self, other: Event) {
        for (name, value) in other.headers {
            self.insert(name, value);
        }
        if let Some(body) = other.body {
            match self.body.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&body);
                }
                None => self.body = Some(body),
            }
        }
    }

    // common header accessors

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event-Name")
    }

    pub fn subclass(&self) -> Option<&str> {
        self.get("Event-Subclass")
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.get("Unique-ID")
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.get("Job-UUID")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.get("Reply-Text")
    }

    /// Server-side time stamp in seconds since the epoch.
    pub fn event_time(&self) -> Option<f64> {
        self.get("Event-Date-Timestamp")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|usecs| usecs / 1e6)
    }

    /// Render this event in wire form: percent-encoded `Name: Value` lines,
    /// a blank line, and a `Content-Length` framed body when one is set.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&percent_encode(value.as_bytes(), WIRE_ESCAPES).to_string());
            out.push('\n');
        }
        match &self.body {
            Some(body) => {
                out.push_str(&format!("Content-Length: {}\n\n", body.len()));
                out.push_str(body);
            }
            None => out.push('\n'),
        }
        out
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event({}",
            self.event_name().unwrap_or("unnamed"),
        )?;
        if let Some(uid) = self.unique_id() {
            write!(f, ", uuid {}", uid)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut event = Event::new();
        event.insert("Event-Name", "CHANNEL_CREATE");
        event.insert("Unique-ID", "abc");
        event.insert("Event-Name", "CHANNEL_ANSWER");
        assert_eq!(event.event_name(), Some("CHANNEL_ANSWER"));
        // arrival order is preserved across replacement
        let names: Vec<&str> = event.headers().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Event-Name", "Unique-ID"]);
    }

    #[test]
    fn merge_overrides_and_appends() {
        let mut outer = Event::new();
        outer.insert("Content-Type", "text/event-plain");
        outer.insert("Shared", "outer");

        let mut inner = Event::with_name("BACKGROUND_JOB");
        inner.insert("Shared", "inner");
        inner.set_body("+OK done");

        outer.merge(inner);
        assert_eq!(outer.get("Shared"), Some("inner"));
        assert_eq!(outer.event_name(), Some("BACKGROUND_JOB"));
        assert_eq!(outer.body(), Some("+OK done"));
    }

    #[test]
    fn event_time_scales_from_microseconds() {
        let mut event = Event::new();
        event.insert("Event-Date-Timestamp", "1500000000000000");
        assert_eq!(event.event_time(), Some(1.5e9));
    }
}
