//! Header transformations shared by the forward and reply handlers.
//!
//! Everything here mutates an [`EmailMessage`] in place; callers rebuild
//! the raw form once, after the last transformation.

use chrono::Utc;
use uuid::Uuid;

use crate::message::EmailMessage;

/// Trace header: delivery phase ("Forward" or "Reply").
pub const HEADER_PHASE: &str = "X-Mailveil-Type";

/// Trace header: delivery-log id, correlates the outbound copy with its
/// bounce address.
pub const HEADER_LOG_ID: &str = "X-Mailveil-Log-ID";

/// Trace header: original envelope sender, preserved before the envelope
/// is rewritten.
pub const HEADER_ENVELOPE_FROM: &str = "X-Mailveil-Envelope-From";

/// Headers that survive the hygiene pass. Everything else (Received chain,
/// DKIM signatures, client fingerprints, tracking headers) is stripped
/// before the message leaves the relay.
pub const ALLOWED_HEADERS: [&str; 10] = [
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "References",
    "In-Reply-To",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

/// Delivery phase recorded in trace headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Reply,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Forward => "Forward",
            Phase::Reply => "Reply",
        }
    }
}

/// Strips every header not on the allow-list.
pub fn sanitize_headers(message: &mut EmailMessage) {
    message.retain_headers(&ALLOWED_HEADERS);
}

/// Appends the relay trace headers for one outbound copy. The original
/// envelope sender is only preserved in the forward phase: on a reply it
/// would disclose the real mailbox to the contact.
pub fn inject_trace_headers(
    message: &mut EmailMessage,
    phase: Phase,
    delivery_log_id: u64,
    original_envelope_from: Option<&str>,
) {
    message.set_header(HEADER_PHASE, phase.as_str());
    message.set_header(HEADER_LOG_ID, &delivery_log_id.to_string());
    if let Some(envelope_from) = original_envelope_from {
        message.set_header(HEADER_ENVELOPE_FROM, envelope_from);
    }
}

/// Replaces the Message-ID with a fresh one scoped to the relay's domain
/// and stamps a current Date. The original Message-ID would leak the
/// sending client's host; References/In-Reply-To keep threading intact.
pub fn assign_message_id(message: &mut EmailMessage, delivery_log_id: u64, domain: &str) {
    message.set_header(
        "Message-ID",
        &format!("<{}.{}@{}>", delivery_log_id, Uuid::new_v4(), domain),
    );
    message.set_header("Date", &Utc::now().to_rfc2822());
}

/// Adds the one-click unsubscribe headers pointing at the relay's
/// unsubscribe address, with the alias id pre-filled in the subject.
pub fn add_list_unsubscribe(message: &mut EmailMessage, unsubscribe_address: &str, alias_id: u64) {
    message.set_header(
        "List-Unsubscribe",
        &format!("<mailto:{unsubscribe_address}?subject={alias_id}=>"),
    );
    message.set_header("List-Unsubscribe-Post", "List-Unsubscribe=One-Click");
}

/// Signs an outbound message for a domain (DKIM or equivalent). Signing is
/// optional; without a signer, mail leaves unsigned.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &mut EmailMessage, domain: &str);
}

/// SPF verdict for a client IP / envelope sender pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfVerdict {
    Pass,
    Fail,
    /// No record, neutral or softfail. Treated as pass: SPF enforcement
    /// only blocks hard failures.
    Inconclusive,
}

/// Verifies the envelope sender against the connecting client.
pub trait SpfVerifier: Send + Sync {
    fn verify(
        &self,
        client_ip: std::net::IpAddr,
        helo_domain: &str,
        envelope_from: &str,
    ) -> SpfVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message() -> EmailMessage {
        EmailMessage::from_raw(
            "boss@corp.example",
            "news@veil.example",
            "Received: from mta.corp.example\r\nDKIM-Signature: v=1; d=corp.example\r\nFrom: boss@corp.example\r\nTo: news@veil.example\r\nSubject: hello\r\nMessage-ID: <abc@mta.corp.example>\r\nX-Mailer: TestMailer\r\n\r\nbody\r\n",
        )
    }

    #[test]
    fn test_sanitize_headers_strips_transport_headers() {
        let mut message = raw_message();
        sanitize_headers(&mut message);

        assert!(message.header("Received").is_none());
        assert!(message.header("DKIM-Signature").is_none());
        assert!(message.header("X-Mailer").is_none());
        assert!(message.header("Message-ID").is_none());
        assert_eq!(message.header("Subject"), Some("hello"));
        assert_eq!(message.header("From"), Some("boss@corp.example"));
    }

    #[test]
    fn test_inject_trace_headers() {
        let mut message = raw_message();
        inject_trace_headers(&mut message, Phase::Forward, 42, Some("boss@corp.example"));

        assert_eq!(message.header(HEADER_PHASE), Some("Forward"));
        assert_eq!(message.header(HEADER_LOG_ID), Some("42"));
        assert_eq!(message.header(HEADER_ENVELOPE_FROM), Some("boss@corp.example"));
    }

    #[test]
    fn test_reply_trace_headers_omit_envelope_from() {
        let mut message = raw_message();
        inject_trace_headers(&mut message, Phase::Reply, 7, None);

        assert_eq!(message.header(HEADER_PHASE), Some("Reply"));
        assert!(message.header(HEADER_ENVELOPE_FROM).is_none());
    }

    #[test]
    fn test_assign_message_id_is_domain_scoped() {
        let mut message = raw_message();
        assign_message_id(&mut message, 7, "veil.example");

        let message_id = message.header("Message-ID").unwrap();
        assert!(message_id.starts_with("<7."));
        assert!(message_id.ends_with("@veil.example>"));
        assert!(message.header("Date").is_some());
        assert_eq!(message.all_headers("Message-ID").len(), 1);
    }

    #[test]
    fn test_add_list_unsubscribe() {
        let mut message = raw_message();
        add_list_unsubscribe(&mut message, "unsubscribe@veil.example", 9);

        assert_eq!(
            message.header("List-Unsubscribe"),
            Some("<mailto:unsubscribe@veil.example?subject=9=>")
        );
        assert_eq!(
            message.header("List-Unsubscribe-Post"),
            Some("List-Unsubscribe=One-Click")
        );
    }
}
