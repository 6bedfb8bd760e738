//! SMTP status lines returned by the engine.
//!
//! One [`Status`] per recipient outcome, reduced to a single line per
//! envelope: any success wins, otherwise the first failure is returned.
//! The `MV E<n>` tags keep distinct failure paths distinguishable in logs.

use std::fmt::Display;

/// A `<3-digit-code> <text>` protocol status line.
///
/// 2xx = accepted (delivered or intentionally dropped), 4xx = temporary,
/// retryable, 5xx = permanent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub text: &'static str,
}

impl Status {
    pub const fn new(code: u16, text: &'static str) -> Self {
        Self { code, text }
    }

    /// Whether the upstream transport should treat the envelope as handled.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    // -- accepted ----------------------------------------------------------

    pub const fn accepted() -> Self {
        Self::new(250, "Message accepted for delivery")
    }

    pub const fn bounce_recorded() -> Self {
        Self::new(250, "MV bounce recorded")
    }

    pub const fn unsubscribe_accepted() -> Self {
        Self::new(250, "MV unsubscribe request accepted")
    }

    /// A reverse alias appeared as envelope sender. Accepted-and-dropped so
    /// the upstream never generates a bounce toward a contact address.
    pub const fn reverse_alias_sender() -> Self {
        Self::new(250, "MV E6 reverse alias cannot be used as sender")
    }

    /// SPF verification failed: accepted without delivery, a 5xx here would
    /// produce a bounce report leaking the reverse-alias relationship.
    pub const fn spf_failed() -> Self {
        Self::new(250, "MV E11 accepted")
    }

    // -- permanent failures ------------------------------------------------

    pub const fn spam_detected() -> Self {
        Self::new(550, "MV E1 message detected as spam")
    }

    pub const fn reply_domain_mismatch() -> Self {
        Self::new(550, "MV E2 reverse alias under foreign domain")
    }

    pub const fn no_such_alias() -> Self {
        Self::new(550, "MV E3 no such address")
    }

    pub const fn no_such_reverse_alias() -> Self {
        Self::new(550, "MV E4 no such reverse alias")
    }

    pub const fn unknown_alias_domain() -> Self {
        Self::new(550, "MV E5 alias domain not handled here")
    }

    pub const fn unauthorized_reply_sender() -> Self {
        Self::new(550, "MV E7 sender not authorized for this alias")
    }

    pub const fn malformed_unsubscribe() -> Self {
        Self::new(550, "MV E8 malformed unsubscribe subject")
    }

    pub const fn unsubscribe_no_such_alias() -> Self {
        Self::new(550, "MV E9 no such alias")
    }

    pub const fn unsubscribe_unauthorized() -> Self {
        Self::new(550, "MV E10 unauthorized")
    }

    pub const fn reply_spam_detected() -> Self {
        Self::new(550, "MV E15 message detected as spam")
    }

    pub const fn no_mailbox() -> Self {
        Self::new(550, "MV E16 alias has no mailbox")
    }

    pub const fn unverified_mailbox() -> Self {
        Self::new(550, "MV E19 unverified mailbox")
    }

    pub const fn account_disabled() -> Self {
        Self::new(550, "MV E20 account disabled")
    }

    pub const fn disabled_mailbox() -> Self {
        Self::new(550, "MV E21 disabled mailbox")
    }

    pub const fn no_such_user() -> Self {
        Self::new(550, "MV E22 no such user")
    }

    pub const fn unsubscribe_wrong_sender() -> Self {
        Self::new(550, "MV E23 unauthorized")
    }

    pub const fn reply_bounced() -> Self {
        Self::new(550, "MV E24 message could not be delivered to contact")
    }

    pub const fn noreply_recipient() -> Self {
        Self::new(550, "MV E25 message sent to no-reply address")
    }

    pub const fn forward_bounced() -> Self {
        Self::new(550, "MV E26 message could not be forwarded to mailbox")
    }

    pub const fn no_such_delivery_log() -> Self {
        Self::new(550, "MV E27 no such delivery log")
    }

    // -- temporary failures ------------------------------------------------

    pub const fn encrypt_retry_forward() -> Self {
        Self::new(421, "MV E12 cannot encrypt, retry later")
    }

    pub const fn encrypt_retry_reply() -> Self {
        Self::new(421, "MV E13 cannot encrypt, retry later")
    }

    pub const fn mailbox_domain_conflict() -> Self {
        Self::new(421, "MV E14 retry later")
    }

    pub const fn recipient_refused() -> Self {
        Self::new(421, "MV E17 retry later")
    }

    pub const fn temporary_failure() -> Self {
        Self::new(421, "MV unavailable, retry later")
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Reduces per-recipient outcomes to a single envelope status: the first
/// success wins, otherwise the first failure is returned. Favoring
/// "accepted" keeps the upstream transport from retrying an envelope that
/// partially succeeded.
pub fn reduce(outcomes: &[Status]) -> Status {
    for outcome in outcomes {
        if outcome.is_success() {
            return outcome.clone();
        }
    }
    outcomes
        .first()
        .cloned()
        .unwrap_or_else(Status::temporary_failure)
}
