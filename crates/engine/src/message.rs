//! Core email message types used throughout the relay pipeline.
//!
//! This module defines [`EmailMessage`], the central representation of an
//! email with structured [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322)
//! headers and cached serialization, and [`Envelope`], the SMTP envelope
//! received before per-recipient classification. Headers are an ordered
//! multimap with explicit set/remove/get-all operations so handlers can
//! recompute full header values instead of patching them in place.

use std::net::IpAddr;

use uuid::Uuid;

/// Represents an email message flowing through the relay.
///
/// Headers are stored as an ordered `Vec` (preserving RFC 5322 order and
/// supporting duplicate headers such as `Received`). A cached `raw` field
/// holds the full serialized form; call [`rebuild`](Self::rebuild) after
/// modifying headers so that [`raw`](Self::raw) reflects the changes.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Unique processing identifier for log correlation.
    pub message_id: String,

    /// Envelope sender address.
    pub from: String,

    /// Envelope recipient address this copy is bound for.
    pub to: String,

    /// IP address of the connecting SMTP client (for SPF verification).
    pub client_ip: Option<IpAddr>,

    /// HELO/EHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,

    /// Ordered list of headers (case-preserved keys, trimmed values).
    headers: Vec<(String, String)>,

    /// Message body after the blank-line separator (RFC 5322 body).
    body: String,

    /// Cached full serialization (headers + blank line + body).
    raw: String,
}

impl EmailMessage {
    pub fn new(from: String, to: String, raw: String) -> Self {
        let message_id = Uuid::new_v4().to_string();
        let (headers, content) = parse_raw_headers(&raw);
        Self {
            message_id,
            from,
            to,
            headers,
            body: content.to_string(),
            raw,
            client_ip: None,
            helo_domain: None,
        }
    }

    pub fn from_raw(from: &str, to: &str, raw: &str) -> Self {
        Self::new(from.to_string(), to.to_string(), raw.to_string())
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of the header matching `name`, in order.
    pub fn all_headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns the email subject (convenience for `header("Subject")`).
    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or_default()
    }

    /// Returns the media type of the `Content-Type` header, lowercased and
    /// without parameters, e.g. `multipart/report`.
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
    }

    /// Returns the full serialized email (headers + blank line + body).
    ///
    /// Returns the cached raw form. Call [`rebuild`](Self::rebuild) after
    /// modifying headers to ensure this is up to date.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the message body after the header section (RFC 5322 body).
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Prepends a header to the beginning of the header list.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(0, (name.to_string(), value.to_string()));
    }

    /// Appends a header to the end of the header list.
    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replaces the first occurrence of `name` with `value`, removing any
    /// further occurrences; appends the header when it was absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let mut replaced = false;
        self.headers.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                replaced = true;
                *v = value.to_string();
            }
            true
        });
        if !replaced {
            self.append_header(name, value);
        }
    }

    /// Removes every occurrence of the header `name`.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Removes every header whose name is not in `allowed`
    /// (case-insensitive comparison).
    pub fn retain_headers(&mut self, allowed: &[&str]) {
        self.headers
            .retain(|(k, _)| allowed.iter().any(|a| a.eq_ignore_ascii_case(k)));
    }

    /// Replaces every occurrence of `needle` in the body.
    pub fn replace_in_body(&mut self, needle: &str, replacement: &str) {
        if self.body.contains(needle) {
            self.body = self.body.replace(needle, replacement);
        }
    }

    /// Prepends a plain-text notice line (followed by a blank line) to the
    /// message body.
    pub fn prepend_body_text(&mut self, text: &str) {
        let mut body = String::with_capacity(text.len() + 4 + self.body.len());
        body.push_str(text);
        body.push_str("\r\n\r\n");
        body.push_str(&self.body);
        self.body = body;
    }

    /// Replaces the entire body.
    pub fn set_body(&mut self, body: String) {
        self.body = body;
    }

    /// Rebuilds the cached raw form from headers and body.
    ///
    /// Call this once after all header modifications are complete so that
    /// [`raw()`](Self::raw) returns the up-to-date serialized form.
    pub fn rebuild(&mut self) {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();

        let capacity = headers_len + if self.headers.is_empty() { 0 } else { 2 } + self.body.len();

        let mut raw = String::with_capacity(capacity);

        for (key, value) in &self.headers {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }

        if !self.headers.is_empty() {
            raw.push_str("\r\n");
        }

        raw.push_str(&self.body);

        self.raw = raw;
    }
}

/// One inbound SMTP envelope: one sender, one-or-more recipients, one
/// payload, plus connection metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Envelope sender address; empty for the null sender (`<>`).
    pub from: String,

    /// Envelope recipient addresses, in RCPT order.
    pub rcpts: Vec<String>,

    /// Raw message data (headers + content).
    pub raw: String,

    /// IP address of the connecting SMTP client.
    pub client_ip: Option<IpAddr>,

    /// HELO/EHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,
}

impl Envelope {
    pub fn new(from: &str, rcpts: Vec<String>, raw: &str) -> Self {
        Self {
            from: from.to_string(),
            rcpts,
            raw: raw.to_string(),
            client_ip: None,
            helo_domain: None,
        }
    }

    /// Creates an [`EmailMessage`] for a specific recipient of this envelope.
    pub fn to_message(&self, rcpt: &str) -> EmailMessage {
        let mut message = EmailMessage::new(self.from.clone(), rcpt.to_string(), self.raw.clone());
        message.client_ip = self.client_ip;
        message.helo_domain = self.helo_domain.clone();
        message
    }
}

/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values; continuation lines (leading whitespace) are folded
/// into the preceding header value.
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let line_len = line.len();
        let end = pos + line_len;
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            // folded continuation of the previous header
            let last = headers.len() - 1;
            headers[last].1.push(' ');
            headers[last].1.push_str(line.trim());
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_message_new() {
        let message = EmailMessage::from_raw(
            "sender@example.com",
            "recipient@example.com",
            "Subject: Hello\r\n\r\nBody text",
        );

        assert_eq!(message.from, "sender@example.com");
        assert_eq!(message.to, "recipient@example.com");
        assert_eq!(message.subject(), "Hello");
        assert_eq!(message.body(), "Body text");
        assert_eq!(message.raw(), "Subject: Hello\r\n\r\nBody text");
    }

    #[test]
    fn test_set_header_replaces_and_deduplicates() {
        let mut message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "To: one@x.com\r\nTo: two@x.com\r\nSubject: Hi\r\n\r\nBody",
        );

        message.set_header("To", "three@x.com");

        assert_eq!(message.all_headers("To"), vec!["three@x.com"]);
        assert_eq!(message.subject(), "Hi");
    }

    #[test]
    fn test_set_header_appends_when_missing() {
        let mut message = EmailMessage::from_raw("a@x.com", "b@y.com", "Subject: Hi\r\n\r\nBody");

        message.set_header("Cc", "cc@x.com");
        message.rebuild();

        assert!(message.raw().contains("Cc: cc@x.com\r\n"));
    }

    #[test]
    fn test_retain_headers_keeps_allow_list_only() {
        let mut message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "Received: relay1\r\nFrom: a@x.com\r\nX-Secret: hidden\r\nSubject: Hi\r\n\r\nBody",
        );

        message.retain_headers(&["From", "Subject"]);
        message.rebuild();

        assert!(message.header("Received").is_none());
        assert!(message.header("X-Secret").is_none());
        assert_eq!(message.header("From"), Some("a@x.com"));
        assert_eq!(message.subject(), "Hi");
    }

    #[test]
    fn test_all_headers_preserves_order() {
        let message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "Cc: first@x.com\r\nSubject: Hi\r\nCc: second@x.com\r\n\r\nBody",
        );

        assert_eq!(message.all_headers("Cc"), vec!["first@x.com", "second@x.com"]);
    }

    #[test]
    fn test_folded_header_value() {
        let message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "Subject: a very\r\n long subject\r\n\r\nBody",
        );

        assert_eq!(message.subject(), "a very long subject");
    }

    #[test]
    fn test_content_type_lowercased_without_parameters() {
        let message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "Content-Type: Multipart/Report; report-type=delivery-status\r\n\r\nBody",
        );

        assert_eq!(message.content_type().as_deref(), Some("multipart/report"));
    }

    #[test]
    fn test_replace_in_body() {
        let mut message = EmailMessage::from_raw(
            "a@x.com",
            "b@y.com",
            "Subject: Hi\r\n\r\nwrite to ra+abc@veil.example please",
        );

        message.replace_in_body("ra+abc@veil.example", "real@contact.example");
        message.rebuild();

        assert!(message.body().contains("real@contact.example"));
        assert!(!message.raw().contains("ra+abc@veil.example"));
    }

    #[test]
    fn test_prepend_body_text() {
        let mut message = EmailMessage::from_raw("a@x.com", "b@y.com", "Subject: Hi\r\n\r\nBody");

        message.prepend_body_text("Notice line");
        message.rebuild();

        assert!(message.body().starts_with("Notice line\r\n\r\n"));
        assert!(message.body().ends_with("Body"));
    }

    #[test]
    fn test_envelope_to_message_per_recipient() {
        let envelope = Envelope::new(
            "sender@example.com",
            vec!["a@x.com".to_string(), "b@x.com".to_string()],
            "Subject: Multi\r\n\r\nBody",
        );

        let msg_a = envelope.to_message("a@x.com");
        let msg_b = envelope.to_message("b@x.com");

        assert_eq!(msg_a.to, "a@x.com");
        assert_eq!(msg_b.to, "b@x.com");
        assert_eq!(msg_a.from, msg_b.from);
        assert_ne!(msg_a.message_id, msg_b.message_id);
    }

    #[test]
    fn test_rebuild_after_header_mutation() {
        let mut message =
            EmailMessage::from_raw("a@x.com", "b@y.com", "Subject: Test\r\n\r\nBody");

        message.prepend_header("X-Custom", "value");
        message.rebuild();

        assert!(message.raw().starts_with("X-Custom: value\r\n"));
        assert!(message.raw().ends_with("Body"));
    }
}
