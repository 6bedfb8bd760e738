//! Forward phase: mail sent by an external party to a published alias,
//! rewritten and delivered to the alias's real mailboxes.

use tracing::{debug, info, warn};

use crate::{
    address,
    directory::{
        Alias, Contact, Directory, DirectoryError, Mailbox, NewContact, NewDeliveryLog,
        QuarantineReason, User,
    },
    encrypt,
    engine::{Engine, EngineError},
    message::{EmailMessage, Envelope},
    notify::{Notification, Notifier},
    spam::SpamScorer,
    status::{self, Status},
    transform::{self, Phase, Signer},
    transport::{Transport, TransportError},
};

/// Body notice prepended when the sender address could not be parsed and
/// the contact points at the no-reply sink.
const INVALID_SENDER_NOTICE: &str =
    "The sender address of this message could not be parsed; replying will not reach the original sender.";

impl Engine {
    pub(crate) async fn handle_forward(
        &self,
        envelope: &Envelope,
        rcpt: &str,
    ) -> Result<Status, EngineError> {
        let alias = match self.directory.get_alias_by_address(rcpt).await? {
            Some(alias) => Some(alias),
            None => self.directory.auto_create_alias(rcpt).await?,
        };
        let Some(alias) = alias.filter(|a| a.deleted_at.is_none()) else {
            debug!(rcpt = %rcpt, "forward to unknown alias");
            return Ok(Status::no_such_alias());
        };

        let Some(user) = self.directory.get_user(alias.user_id).await? else {
            return Ok(Status::no_such_user());
        };
        if user.disabled {
            return Ok(Status::account_disabled());
        }

        let mut mailboxes = Vec::with_capacity(alias.mailbox_ids.len());
        for id in &alias.mailbox_ids {
            if let Some(mailbox) = self.directory.get_mailbox(*id).await? {
                mailboxes.push(mailbox);
            }
        }

        // a mailbox emailing its own alias is a loop; quarantine instead of
        // bouncing so the loop cannot amplify
        let from = address::normalize(&envelope.from);
        if let Some(own) = mailboxes.iter().find(|m| m.address == from) {
            warn!(alias = %alias.address, mailbox = %own.address, "alias received mail from its own mailbox");
            self.directory
                .create_quarantined_message(
                    user.id,
                    QuarantineReason::Cycle,
                    envelope.raw.clone(),
                    None,
                )
                .await?;
            self.notifier
                .notify(Notification::SelfCycle {
                    recipient: own.address.clone(),
                    alias: alias.address.clone(),
                })
                .await;
            return Ok(Status::accepted());
        }

        let probe = envelope.to_message(rcpt);
        let contact = self.resolve_sender_contact(&alias, &probe, &from).await?;

        // dropping silently: a bounce here would leak that the alias exists
        if !alias.enabled || contact.blocked {
            self.directory
                .create_delivery_log(NewDeliveryLog {
                    contact_id: contact.id,
                    user_id: user.id,
                    mailbox_id: None,
                    is_reply: false,
                    blocked: true,
                })
                .await?;
            info!(alias = %alias.address, contact = %contact.address, "forward silently dropped");
            return Ok(Status::accepted());
        }

        if mailboxes.is_empty() {
            warn!(alias = %alias.address, "enabled alias without mailbox");
            return Ok(Status::no_mailbox());
        }

        let mut outcomes = Vec::with_capacity(mailboxes.len());
        for mailbox in &mailboxes {
            let outcome = self
                .forward_to_mailbox(envelope, rcpt, &alias, &user, &contact, mailbox)
                .await?;
            outcomes.push(outcome);
        }
        Ok(status::reduce(&outcomes))
    }

    async fn forward_to_mailbox(
        &self,
        envelope: &Envelope,
        rcpt: &str,
        alias: &Alias,
        user: &User,
        contact: &Contact,
        mailbox: &Mailbox,
    ) -> Result<Status, EngineError> {
        if !mailbox.verified {
            return Ok(Status::unverified_mailbox());
        }
        if mailbox.disabled {
            return Ok(Status::disabled_mailbox());
        }
        // forwarding back into the alias's own domain would loop
        if address::domain_part(&mailbox.address) == address::domain_part(&alias.address) {
            warn!(alias = %alias.address, mailbox = %mailbox.address, "mailbox under alias domain");
            self.notifier
                .notify(Notification::MailboxDomainConflict {
                    recipient: mailbox.address.clone(),
                    alias: alias.address.clone(),
                })
                .await;
            return Ok(Status::mailbox_domain_conflict());
        }

        let mut message = envelope.to_message(rcpt);
        let log = self
            .directory
            .create_delivery_log(NewDeliveryLog {
                contact_id: contact.id,
                user_id: user.id,
                mailbox_id: Some(mailbox.id),
                is_reply: false,
                blocked: false,
            })
            .await?;

        if let Some(scorer) = &self.scorer {
            let verdict = scorer.score(&message).await?;
            let threshold = user.max_spam_score.unwrap_or(self.config.max_spam_score);
            if verdict.score > threshold {
                let quarantined = self
                    .directory
                    .create_quarantined_message(
                        user.id,
                        QuarantineReason::Spam,
                        envelope.raw.clone(),
                        None,
                    )
                    .await?;
                let mut flagged = log.clone();
                flagged.is_spam = true;
                flagged.spam_score = Some(verdict.score);
                flagged.quarantine_id = Some(quarantined.id);
                self.directory.update_delivery_log(flagged).await?;
                self.notifier
                    .notify(Notification::SpamBlocked {
                        recipient: mailbox.address.clone(),
                        alias: alias.address.clone(),
                        is_reply: false,
                    })
                    .await;
                warn!(alias = %alias.address, score = verdict.score, threshold, "forward blocked as spam");
                return Ok(Status::spam_detected());
            }
            let mut scored = log.clone();
            scored.spam_score = Some(verdict.score);
            self.directory.update_delivery_log(scored).await?;
        }

        if contact.invalid {
            message.prepend_body_text(INVALID_SENDER_NOTICE);
        }

        transform::sanitize_headers(&mut message);

        if let (Some(encryptor), Some(key)) = (&self.encryptor, &mailbox.pgp) {
            if user.premium && !alias.disable_pgp {
                if let Some(generic) = &mailbox.generic_subject {
                    let original = message.subject().to_string();
                    if !original.is_empty() {
                        message.prepend_body_text(&format!("Subject: {original}"));
                    }
                    message.set_header("Subject", generic);
                }
                if let Err(e) = encrypt::encrypt_message(&mut message, key, encryptor.as_ref()) {
                    warn!(mailbox = %mailbox.address, error = %e, "forward encryption failed");
                    self.directory.delete_delivery_log(log.id).await?;
                    return Ok(Status::encrypt_retry_forward());
                }
            }
        }

        // From now aligns with this deployment's domain for DMARC purposes
        message.set_header("From", &contact.reverse_alias_with_name());
        self.rewrite_forward_recipients(&mut message, alias).await?;

        transform::inject_trace_headers(&mut message, Phase::Forward, log.id, Some(&envelope.from));
        transform::assign_message_id(&mut message, log.id, &self.config.domain);
        if let Some(unsubscribe) = &self.config.unsubscribe_address {
            transform::add_list_unsubscribe(&mut message, unsubscribe, alias.id);
        }
        if let Some(signer) = &self.signer {
            signer.sign(&mut message, &self.config.domain);
        }
        message.rebuild();

        let bounce_from = address::encode_bounce_address(log.id, &self.config.domain);
        match self
            .transport
            .send(&bounce_from, &mailbox.address, message.raw())
            .await
        {
            Ok(()) => {
                info!(
                    alias = %alias.address,
                    mailbox = %mailbox.address,
                    log_id = log.id,
                    "forward delivered"
                );
                Ok(Status::accepted())
            }
            Err(TransportError::RecipientRejected(reply)) => {
                warn!(mailbox = %mailbox.address, reply = %reply, "forward recipient refused");
                Ok(Status::recipient_refused())
            }
            Err(TransportError::Connection(e)) => Err(EngineError::Transport(e)),
        }
    }

    /// Resolves the Contact for the sending party: Reply-To preferred, then
    /// From, then the envelope sender. An unparseable sender still gets a
    /// Contact, flagged invalid and pointing at the no-reply sink.
    async fn resolve_sender_contact(
        &self,
        alias: &Alias,
        message: &EmailMessage,
        envelope_from: &str,
    ) -> Result<Contact, EngineError> {
        let raw_from = message.header("From");
        let header = message.header("Reply-To").or(raw_from);
        let (mut name, mut addr) = match header {
            Some(value) => address::parse_single_address(value),
            None => (String::new(), String::new()),
        };
        if !address::is_valid_email(&addr) {
            if address::is_valid_email(envelope_from) {
                addr = envelope_from.to_string();
                name = String::new();
            } else {
                addr = String::new();
            }
        }
        self.get_or_create_contact(alias, &addr, &name, raw_from, envelope_from, false)
            .await
    }

    /// Idempotent contact resolution: a creation conflict from a concurrent
    /// duplicate is resolved by re-reading the existing row.
    pub(crate) async fn get_or_create_contact(
        &self,
        alias: &Alias,
        addr: &str,
        name: &str,
        raw_from: Option<&str>,
        envelope_from: &str,
        is_cc: bool,
    ) -> Result<Contact, EngineError> {
        if let Some(existing) = self
            .directory
            .get_contact_by_alias_and_address(alias.id, addr)
            .await?
        {
            // display-name refresh is best effort
            if !name.is_empty() && existing.name.as_deref() != Some(name) {
                let mut updated = existing.clone();
                updated.name = Some(name.to_string());
                match self.directory.update_contact(updated.clone()).await {
                    Ok(()) => return Ok(updated),
                    Err(e) => {
                        debug!(contact = existing.id, error = %e, "contact name refresh skipped");
                        return Ok(existing);
                    }
                }
            }
            return Ok(existing);
        }

        let invalid = addr.is_empty();
        let reverse_alias = if invalid {
            self.config.noreply()
        } else {
            address::encode_reverse_alias(&self.config.domain)
        };
        let created = self
            .directory
            .create_contact(NewContact {
                alias_id: alias.id,
                user_id: alias.user_id,
                address: addr.to_string(),
                name: (!name.is_empty()).then(|| name.to_string()),
                raw_from_header: raw_from.map(str::to_string),
                raw_envelope_from: (!envelope_from.is_empty())
                    .then(|| envelope_from.to_string()),
                reverse_alias,
                is_cc,
                invalid,
            })
            .await;
        match created {
            Ok(contact) => Ok(contact),
            Err(DirectoryError::Conflict) => {
                match self
                    .directory
                    .get_contact_by_alias_and_address(alias.id, addr)
                    .await?
                {
                    Some(contact) => Ok(contact),
                    None => Err(DirectoryError::Conflict.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recomputes To/Cc: the alias stays untouched, every other resolvable
    /// address is mapped to its own contact's reverse alias, the rest are
    /// dropped.
    async fn rewrite_forward_recipients(
        &self,
        message: &mut EmailMessage,
        alias: &Alias,
    ) -> Result<(), EngineError> {
        for header in ["To", "Cc"] {
            let Some(value) = message.header(header).map(str::to_string) else {
                continue;
            };
            let mut rewritten = Vec::new();
            for (name, addr) in address::parse_address_list(&value) {
                if addr == alias.address {
                    rewritten.push(address::format_address(&name, &addr));
                    continue;
                }
                if !address::is_valid_email(&addr) {
                    continue;
                }
                let other = self
                    .get_or_create_contact(alias, &addr, &name, None, "", header == "Cc")
                    .await?;
                rewritten.push(address::format_address(&name, &other.reverse_alias));
            }
            if rewritten.is_empty() {
                message.remove_header(header);
            } else {
                message.set_header(header, &rewritten.join(", "));
            }
        }
        Ok(())
    }
}
