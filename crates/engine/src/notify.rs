//! Out-of-band notifications toward users and mailboxes.
//!
//! Handlers emit a [`Notification`] whenever mail is dropped, blocked or
//! deferred for a reason the user can act on. Delivery of the notification
//! itself is a [`Notifier`] concern; the engine only decides when to emit.
//! Each notification kind carries a per-recipient daily cap so a burst of
//! rejected mail cannot flood the user's real mailbox.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Mutex,
};

use tracing::info;

/// Boxed future type for notification delivery, enabling object safety.
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// One user-facing event, addressed to a real mailbox or account address.
#[derive(Debug, Clone)]
pub enum Notification {
    /// An alias received mail from one of its own mailboxes.
    SelfCycle { recipient: String, alias: String },
    /// Forwarding would deliver back into the same domain the mail came
    /// from, a loop risk.
    MailboxDomainConflict { recipient: String, alias: String },
    /// A message was quarantined as spam.
    SpamBlocked {
        recipient: String,
        alias: String,
        is_reply: bool,
    },
    /// A forwarded message bounced at the mailbox.
    Bounced { recipient: String, alias: String },
    /// Bounces crossed the disable threshold and the alias was switched off.
    AliasAutoDisabled { recipient: String, alias: String },
    /// A reply bounced at the contact.
    ReplyBounced { recipient: String, alias: String },
    /// Someone other than an authorized mailbox tried to send through a
    /// reverse alias.
    UnauthorizedReplySender { recipient: String, alias: String },
    /// A reverse alias appeared as the envelope sender of an inbound
    /// message, a spoofing attempt against the contact.
    ReverseAliasSender { recipient: String, alias: String },
    /// A reply was refused by the next hop; the sender should retry from
    /// their own mailbox.
    ReplyDeliveryFailed { recipient: String, contact: String },
    /// A reply failed SPF and was dropped.
    SpfFailed { recipient: String, alias: String },
    /// An alias was disabled through the unsubscribe surface.
    AliasDisabledByUnsubscribe { recipient: String, alias: String },
    /// Account notifications were switched off through the unsubscribe
    /// surface.
    NotificationsDisabled { recipient: String },
}

impl Notification {
    /// Stable kind tag, used for logging and rate-cap bucketing.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SelfCycle { .. } => "self_cycle",
            Notification::MailboxDomainConflict { .. } => "mailbox_domain_conflict",
            Notification::SpamBlocked { .. } => "spam_blocked",
            Notification::Bounced { .. } => "bounced",
            Notification::AliasAutoDisabled { .. } => "alias_auto_disabled",
            Notification::ReplyBounced { .. } => "reply_bounced",
            Notification::UnauthorizedReplySender { .. } => "unauthorized_reply_sender",
            Notification::ReverseAliasSender { .. } => "reverse_alias_sender",
            Notification::ReplyDeliveryFailed { .. } => "reply_delivery_failed",
            Notification::SpfFailed { .. } => "spf_failed",
            Notification::AliasDisabledByUnsubscribe { .. } => "alias_disabled_by_unsubscribe",
            Notification::NotificationsDisabled { .. } => "notifications_disabled",
        }
    }

    /// The real address the notification goes to.
    pub fn recipient(&self) -> &str {
        match self {
            Notification::SelfCycle { recipient, .. }
            | Notification::MailboxDomainConflict { recipient, .. }
            | Notification::SpamBlocked { recipient, .. }
            | Notification::Bounced { recipient, .. }
            | Notification::AliasAutoDisabled { recipient, .. }
            | Notification::ReplyBounced { recipient, .. }
            | Notification::UnauthorizedReplySender { recipient, .. }
            | Notification::ReverseAliasSender { recipient, .. }
            | Notification::ReplyDeliveryFailed { recipient, .. }
            | Notification::SpfFailed { recipient, .. }
            | Notification::AliasDisabledByUnsubscribe { recipient, .. }
            | Notification::NotificationsDisabled { recipient } => recipient,
        }
    }

    /// Maximum deliveries of this kind per recipient per day. Loop-ish
    /// events get the tightest cap since one broken client can emit them
    /// continuously.
    pub fn alert_cap(&self) -> u32 {
        match self {
            Notification::SelfCycle { .. } | Notification::MailboxDomainConflict { .. } => 1,
            _ => 10,
        }
    }
}

/// Delivers notifications. Implementations apply the per-kind cap.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: Notification) -> NotifyFuture<'a>;
}

/// Notifier that records events to the structured log and counts them.
///
/// Used in tests and in deployments where notification email is handled by
/// an external process tailing the log.
#[derive(Default)]
pub struct LogNotifier {
    counts: Mutex<HashMap<(&'static str, String), u32>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications of `kind` delivered to `recipient`.
    pub fn sent_count(&self, kind: &str, recipient: &str) -> u32 {
        self.lock()
            .iter()
            .find(|((k, r), _)| *k == kind && r == recipient)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Total notifications delivered.
    pub fn total_sent(&self) -> u32 {
        self.lock().values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(&'static str, String), u32>> {
        self.counts.lock().expect("notifier lock poisoned")
    }
}

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, notification: Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            let kind = notification.kind();
            let recipient = notification.recipient().to_string();
            let cap = notification.alert_cap();

            let mut counts = self.lock();
            let count = counts.entry((kind, recipient.clone())).or_insert(0);
            if *count >= cap {
                info!(kind, recipient = %recipient, "notification suppressed by cap");
                return;
            }
            *count += 1;
            info!(kind, recipient = %recipient, "notification sent");
        })
    }
}
