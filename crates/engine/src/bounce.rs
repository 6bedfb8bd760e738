//! Bounce phase: delivery-status notifications arriving on the VERP
//! envelope-from address of an earlier forward or reply.

use tracing::{info, warn};

use crate::{
    address,
    directory::{Alias, Contact, DeliveryLog, Directory, QuarantineReason, User},
    engine::{Engine, EngineError},
    message::{EmailMessage, Envelope},
    notify::{Notification, Notifier},
    status::Status,
};

impl Engine {
    pub(crate) async fn handle_bounce(
        &self,
        envelope: &Envelope,
        rcpt: &str,
    ) -> Result<Status, EngineError> {
        let Some(log_id) = address::decode_bounce_id(rcpt, &self.config.domain) else {
            warn!(rcpt = %rcpt, "malformed bounce address");
            return Ok(Status::no_such_delivery_log());
        };
        let Some(log) = self.directory.get_delivery_log(log_id).await? else {
            warn!(log_id, "bounce for unknown delivery log");
            return Ok(Status::no_such_delivery_log());
        };
        let Some(contact) = self.directory.get_contact(log.contact_id).await? else {
            return Ok(Status::no_such_delivery_log());
        };
        let Some(alias) = self.directory.get_alias(contact.alias_id).await? else {
            return Ok(Status::no_such_alias());
        };
        let Some(user) = self.directory.get_user(alias.user_id).await? else {
            return Ok(Status::no_such_user());
        };

        if log.is_reply {
            // a real DSN is a multipart/report from the null sender; anything
            // else on this address is autoresponder noise ("out of office")
            // and is re-injected toward the alias as a fresh forward
            let message = envelope.to_message(rcpt);
            let from = address::normalize(&envelope.from);
            let is_report = message.content_type().as_deref() == Some("multipart/report");
            if !is_report || !from.is_empty() {
                info!(log_id = log.id, from = %from, "auto reply on reply bounce address");
                let mut auto = log.clone();
                auto.auto_replied = true;
                self.directory.update_delivery_log(auto).await?;
                return self.handle_forward(envelope, &alias.address).await;
            }
            return self
                .handle_reply_bounce(envelope, &message, log, &contact, &alias, &user)
                .await;
        }

        self.handle_forward_bounce(envelope, rcpt, log, &contact, &alias, &user)
            .await
    }

    /// A reply toward the contact bounced. No disable policy applies: a
    /// contact's mailbox being wrong is not the alias owner's fault.
    async fn handle_reply_bounce(
        &self,
        envelope: &Envelope,
        message: &EmailMessage,
        log: DeliveryLog,
        contact: &Contact,
        alias: &Alias,
        user: &User,
    ) -> Result<Status, EngineError> {
        self.directory.record_bounce(&contact.address).await?;

        let original = extract_original_message(message);
        let quarantined = self
            .directory
            .create_quarantined_message(
                user.id,
                QuarantineReason::Bounce,
                envelope.raw.clone(),
                original,
            )
            .await?;

        let mut bounced = log;
        bounced.bounced = true;
        bounced.quarantine_id = Some(quarantined.id);
        let log_id = bounced.id;
        let mailbox_id = bounced.mailbox_id;
        self.directory.update_delivery_log(bounced).await?;

        let recipient = match mailbox_id {
            Some(id) => match self.directory.get_mailbox(id).await? {
                Some(mailbox) => mailbox.address,
                None => user.address.clone(),
            },
            None => user.address.clone(),
        };
        self.notifier
            .notify(Notification::ReplyBounced {
                recipient,
                alias: alias.address.clone(),
            })
            .await;

        warn!(log_id, contact = %contact.address, "reply bounced at contact");
        Ok(Status::reply_bounced())
    }

    /// A forward toward one of the user's mailboxes bounced. Applies the
    /// external disable policy once the log is marked.
    async fn handle_forward_bounce(
        &self,
        envelope: &Envelope,
        rcpt: &str,
        log: DeliveryLog,
        contact: &Contact,
        alias: &Alias,
        user: &User,
    ) -> Result<Status, EngineError> {
        let recipient = match log.mailbox_id {
            Some(id) => match self.directory.get_mailbox(id).await? {
                Some(mailbox) => mailbox.address,
                None => user.address.clone(),
            },
            None => user.address.clone(),
        };
        self.directory.record_bounce(&recipient).await?;

        let message = envelope.to_message(rcpt);
        let original = extract_original_message(&message);
        let quarantined = self
            .directory
            .create_quarantined_message(
                user.id,
                QuarantineReason::Bounce,
                envelope.raw.clone(),
                original,
            )
            .await?;

        let mut bounced = log;
        bounced.bounced = true;
        bounced.quarantine_id = Some(quarantined.id);
        let log_id = bounced.id;
        self.directory.update_delivery_log(bounced).await?;

        if self.directory.should_disable_alias(alias.id).await? {
            warn!(alias = %alias.address, "alias disabled after repeated bounces");
            self.directory.disable_alias(alias.id).await?;
            self.notifier
                .notify(Notification::AliasAutoDisabled {
                    recipient,
                    alias: alias.address.clone(),
                })
                .await;
        } else {
            self.notifier
                .notify(Notification::Bounced {
                    recipient,
                    alias: alias.address.clone(),
                })
                .await;
        }

        warn!(log_id, contact = %contact.address, alias = %alias.address, "forward bounced at mailbox");
        Ok(Status::forward_bounced())
    }
}

/// Pulls the original message out of a `multipart/report` DSN: the body of
/// the `message/rfc822` part, when one exists.
fn extract_original_message(message: &EmailMessage) -> Option<String> {
    let content_type = message.header("Content-Type")?;
    let boundary = boundary_param(content_type)?;
    let delimiter = format!("--{boundary}");

    for part in message.body().split(delimiter.as_str()).skip(1) {
        let part = part.trim_start_matches(['\r', '\n']);
        if part.starts_with('-') {
            // closing delimiter
            break;
        }
        let (headers, body) = match part.split_once("\r\n\r\n").or_else(|| part.split_once("\n\n"))
        {
            Some(split) => split,
            None => continue,
        };
        if headers.to_lowercase().contains("message/rfc822") {
            return Some(body.trim_end_matches(['\r', '\n']).to_string());
        }
    }
    None
}

/// Extracts the `boundary` parameter from a Content-Type value.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}
