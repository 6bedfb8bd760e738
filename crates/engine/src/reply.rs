//! Reply phase: mail sent by an alias owner's mailbox to a reverse alias,
//! rewritten so the contact sees only the alias.

use tracing::{info, warn};

use crate::{
    address,
    directory::{Alias, Directory, Mailbox, NewDeliveryLog, QuarantineReason},
    encrypt,
    engine::{Engine, EngineError},
    message::{EmailMessage, Envelope},
    notify::{Notification, Notifier},
    spam::SpamScorer,
    status::Status,
    transform::{self, Phase, Signer, SpfVerdict, SpfVerifier},
    transport::Transport,
};

impl Engine {
    pub(crate) async fn handle_reply(
        &self,
        envelope: &Envelope,
        rcpt: &str,
    ) -> Result<Status, EngineError> {
        // reverse aliases only live under the deployment domain
        if address::domain_part(rcpt) != self.config.domain {
            return Ok(Status::reply_domain_mismatch());
        }

        let reverse_alias = address::normalize_reverse_alias(rcpt);
        let Some(contact) = self
            .directory
            .get_contact_by_reverse_alias(&reverse_alias)
            .await?
        else {
            warn!(rcpt = %rcpt, "reply to unknown reverse alias");
            return Ok(Status::no_such_reverse_alias());
        };

        let Some(alias) = self.directory.get_alias(contact.alias_id).await? else {
            return Ok(Status::no_such_alias());
        };
        // stale data after a custom-domain removal
        if !self.config.is_valid_alias_domain(&alias.address) {
            return Ok(Status::unknown_alias_domain());
        }

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

        // anti-spoofing: only the alias's own mailboxes (or their authorized
        // alternates) may send through a reverse alias
        let from = address::normalize(&envelope.from);
        let sender_mailbox = mailboxes
            .iter()
            .find(|m| m.address == from || m.authorized_addresses.iter().any(|a| a == &from));
        let mailbox = match sender_mailbox {
            Some(mailbox) => mailbox,
            None if alias.disable_spoofing_check => match mailboxes.first() {
                Some(mailbox) => mailbox,
                None => return Ok(Status::no_mailbox()),
            },
            None => {
                warn!(alias = %alias.address, sender = %from, "unauthorized reply sender");
                self.notifier
                    .notify(Notification::UnauthorizedReplySender {
                        recipient: user.address.clone(),
                        alias: alias.address.clone(),
                    })
                    .await;
                self.notifier
                    .notify(Notification::UnauthorizedReplySender {
                        recipient: from.clone(),
                        alias: alias.address.clone(),
                    })
                    .await;
                return Ok(Status::unauthorized_reply_sender());
            }
        };

        // SPF hard-fail drops the message but answers success: a bounce
        // would leak the alias/contact relationship to the spoofer
        if self.config.enforce_spf && mailbox.force_spf && !alias.disable_spoofing_check {
            if let (Some(verifier), Some(client_ip)) = (&self.spf, envelope.client_ip) {
                let helo = envelope.helo_domain.as_deref().unwrap_or("");
                if verifier.verify(client_ip, helo, &from) == SpfVerdict::Fail {
                    warn!(sender = %from, client_ip = %client_ip, "reply dropped on SPF failure");
                    self.notifier
                        .notify(Notification::SpfFailed {
                            recipient: mailbox.address.clone(),
                            alias: alias.address.clone(),
                        })
                        .await;
                    return Ok(Status::spf_failed());
                }
            }
        }

        let log = self
            .directory
            .create_delivery_log(NewDeliveryLog {
                contact_id: contact.id,
                user_id: user.id,
                mailbox_id: Some(mailbox.id),
                is_reply: true,
                blocked: false,
            })
            .await?;

        let mut message = envelope.to_message(rcpt);

        if let Some(scorer) = &self.scorer {
            let verdict = scorer.score(&message).await?;
            // fixed threshold: reply-phase content is attacker-controlled
            if verdict.score > self.config.max_reply_spam_score {
                self.directory
                    .create_quarantined_message(
                        user.id,
                        QuarantineReason::Spam,
                        envelope.raw.clone(),
                        None,
                    )
                    .await?;
                self.notifier
                    .notify(Notification::SpamBlocked {
                        recipient: mailbox.address.clone(),
                        alias: alias.address.clone(),
                        is_reply: true,
                    })
                    .await;
                // the message was never sent; keeping the log would poison
                // bounce tracking
                self.directory.delete_delivery_log(log.id).await?;
                warn!(alias = %alias.address, score = verdict.score, "reply blocked as spam");
                return Ok(Status::reply_spam_detected());
            }
        }

        transform::sanitize_headers(&mut message);

        if user.replace_reverse_alias && !contact.address.is_empty() {
            message.replace_in_body(&contact.reverse_alias, &contact.address);
        }

        if let (Some(encryptor), Some(key)) = (&self.encryptor, &contact.pgp) {
            if user.premium {
                if let Err(e) = encrypt::encrypt_message(&mut message, key, encryptor.as_ref()) {
                    warn!(contact = %contact.address, error = %e, "reply encryption failed");
                    self.directory.delete_delivery_log(log.id).await?;
                    return Ok(Status::encrypt_retry_reply());
                }
            }
        }

        message.set_header(
            "From",
            &address::format_address(alias.name.as_deref().unwrap_or(""), &alias.address),
        );
        self.rewrite_reply_recipients(&mut message, &alias).await?;

        let alias_domain = address::domain_part(&alias.address).to_string();
        transform::inject_trace_headers(&mut message, Phase::Reply, log.id, None);
        transform::assign_message_id(&mut message, log.id, &alias_domain);
        if let Some(signer) = &self.signer {
            signer.sign(&mut message, &alias_domain);
        }
        message.rebuild();

        let bounce_from = address::encode_bounce_address(log.id, &self.config.domain);
        match self
            .transport
            .send(&bounce_from, &contact.address, message.raw())
            .await
        {
            Ok(()) => {
                info!(
                    alias = %alias.address,
                    contact = %contact.address,
                    log_id = log.id,
                    "reply delivered"
                );
                Ok(Status::accepted())
            }
            Err(e) => {
                // the owner is told out of band; a failure status would make
                // the originating client retry indefinitely
                warn!(contact = %contact.address, error = %e, "reply delivery failed");
                self.notifier
                    .notify(Notification::ReplyDeliveryFailed {
                        recipient: mailbox.address.clone(),
                        contact: contact.address.clone(),
                    })
                    .await;
                Ok(Status::accepted())
            }
        }
    }

    /// Recomputes To/Cc for the contact's view: reverse aliases resolve back
    /// to their contact's real address, the alias's own address is dropped,
    /// anything unresolvable passes through unchanged.
    async fn rewrite_reply_recipients(
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
                    continue;
                }
                if address::is_reverse_alias(&addr) {
                    let normalized = address::normalize_reverse_alias(&addr);
                    if let Some(other) = self
                        .directory
                        .get_contact_by_reverse_alias(&normalized)
                        .await?
                    {
                        rewritten.push(address::format_address(&name, &other.address));
                        continue;
                    }
                }
                rewritten.push(address::format_address(&name, &addr));
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::EngineConfig,
        directory::{MemoryDirectory, NewContact, PgpKey, User},
        notify::LogNotifier,
        testing::{RecordingTransport, StubEncryptor, StubScorer, StubSpfVerifier},
        transform::HEADER_PHASE,
    };

    struct Setup {
        engine: Engine,
        directory: Arc<MemoryDirectory>,
        transport: Arc<RecordingTransport>,
        notifier: Arc<LogNotifier>,
    }

    fn setup() -> Setup {
        let directory = Arc::new(MemoryDirectory::new());
        directory.seed_user(User::new(1, "owner@real.example"));
        directory.seed_mailbox(Mailbox::new(1, "me@real.example"));
        directory.seed_alias(Alias::new(1, "news@veil.example", 1, vec![1]));

        let transport = Arc::new(RecordingTransport::new());
        let notifier = Arc::new(LogNotifier::new());
        let engine = Engine::new(
            EngineConfig::for_domain("veil.example"),
            directory.clone(),
            transport.clone(),
            notifier.clone(),
        );
        Setup {
            engine,
            directory,
            transport,
            notifier,
        }
    }

    async fn seed_contact(directory: &MemoryDirectory) -> crate::directory::Contact {
        directory
            .create_contact(NewContact {
                alias_id: 1,
                user_id: 1,
                address: "boss@corp.example".to_string(),
                name: Some("Boss".to_string()),
                raw_from_header: None,
                raw_envelope_from: None,
                reverse_alias: "ra+bosstoken@veil.example".to_string(),
                is_cc: false,
                invalid: false,
            })
            .await
            .unwrap()
    }

    fn reply_envelope() -> Envelope {
        Envelope::new(
            "me@real.example",
            vec!["ra+bosstoken@veil.example".to_string()],
            "From: me@real.example\r\nTo: ra+bosstoken@veil.example\r\nSubject: re: hello\r\nMessage-ID: <r1@real.example>\r\n\r\nreply body with ra+bosstoken@veil.example inside\r\n",
        )
    }

    #[tokio::test]
    async fn test_reply_rewrites_and_delivers_to_contact() {
        let s = setup();
        seed_contact(&s.directory).await;

        assert_eq!(s.engine.handle(&reply_envelope()).await, Status::accepted());

        let sent = s.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope_to, "boss@corp.example");
        assert_eq!(sent[0].envelope_from, "bounce+1+@veil.example");

        let raw = &sent[0].raw;
        assert!(raw.contains("From: news@veil.example"));
        assert!(raw.contains("To: boss@corp.example"));
        assert!(raw.contains(&format!("{HEADER_PHASE}: Reply")));
        // the mailbox address never reaches the contact
        assert!(!raw.contains("me@real.example"));
        assert!(!raw.contains("<r1@real.example>"));

        let logs = s.directory.delivery_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_reply);
    }

    #[tokio::test]
    async fn test_reply_foreign_domain_rejected() {
        let s = setup();
        let envelope = Envelope::new(
            "me@real.example",
            vec!["ra+tok@other.example".to_string()],
            "From: me@real.example\r\n\r\nbody\r\n",
        );
        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::reply_domain_mismatch()
        );
    }

    #[tokio::test]
    async fn test_reply_unknown_reverse_alias_rejected() {
        let s = setup();
        let envelope = Envelope::new(
            "me@real.example",
            vec!["ra+unknown@veil.example".to_string()],
            "From: me@real.example\r\n\r\nbody\r\n",
        );
        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::no_such_reverse_alias()
        );
    }

    #[tokio::test]
    async fn test_reply_unauthorized_sender_blocked_with_alerts() {
        let s = setup();
        seed_contact(&s.directory).await;
        let envelope = Envelope::new(
            "attacker@evil.example",
            vec!["ra+bosstoken@veil.example".to_string()],
            "From: attacker@evil.example\r\n\r\nspoof\r\n",
        );

        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::unauthorized_reply_sender()
        );
        assert!(s.transport.sent().is_empty());
        assert_eq!(
            s.notifier
                .sent_count("unauthorized_reply_sender", "owner@real.example"),
            1
        );
        assert_eq!(
            s.notifier
                .sent_count("unauthorized_reply_sender", "attacker@evil.example"),
            1
        );
    }

    #[tokio::test]
    async fn test_reply_authorized_alternate_sender_allowed() {
        let s = setup();
        seed_contact(&s.directory).await;
        let mut mailbox = Mailbox::new(1, "me@real.example");
        mailbox.authorized_addresses = vec!["me@laptop.example".to_string()];
        s.directory.seed_mailbox(mailbox);

        let envelope = Envelope::new(
            "me@laptop.example",
            vec!["ra+bosstoken@veil.example".to_string()],
            "From: me@laptop.example\r\nTo: ra+bosstoken@veil.example\r\n\r\nbody\r\n",
        );
        assert_eq!(s.engine.handle(&envelope).await, Status::accepted());
        assert_eq!(s.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_spoofing_check_disabled_falls_back() {
        let s = setup();
        seed_contact(&s.directory).await;
        let mut alias = Alias::new(1, "news@veil.example", 1, vec![1]);
        alias.disable_spoofing_check = true;
        s.directory.seed_alias(alias);

        let envelope = Envelope::new(
            "someone@else.example",
            vec!["ra+bosstoken@veil.example".to_string()],
            "From: someone@else.example\r\nTo: ra+bosstoken@veil.example\r\n\r\nbody\r\n",
        );
        assert_eq!(s.engine.handle(&envelope).await, Status::accepted());
        assert_eq!(s.transport.sent().len(), 1);
    }

    fn spf_setup(verdict: SpfVerdict) -> Setup {
        let mut s = setup();
        let mut mailbox = Mailbox::new(1, "me@real.example");
        mailbox.force_spf = true;
        s.directory.seed_mailbox(mailbox);
        let mut config = EngineConfig::for_domain("veil.example");
        config.enforce_spf = true;
        s.engine = Engine::new(
            config,
            s.directory.clone(),
            s.transport.clone(),
            s.notifier.clone(),
        )
        .with_spf_verifier(Arc::new(StubSpfVerifier::new(verdict)));
        s
    }

    fn reply_envelope_from_ip() -> Envelope {
        let mut envelope = reply_envelope();
        envelope.client_ip = Some("192.0.2.10".parse().unwrap());
        envelope.helo_domain = Some("real.example".to_string());
        envelope
    }

    #[tokio::test]
    async fn test_reply_spf_failure_dropped_with_alert() {
        let s = spf_setup(SpfVerdict::Fail);
        seed_contact(&s.directory).await;

        // nominal success so the spoofer learns nothing, but no delivery
        assert_eq!(
            s.engine.handle(&reply_envelope_from_ip()).await,
            Status::spf_failed()
        );
        assert!(s.transport.sent().is_empty());
        assert!(s.directory.delivery_logs().is_empty());
        assert_eq!(s.notifier.sent_count("spf_failed", "me@real.example"), 1);
    }

    #[tokio::test]
    async fn test_reply_spf_pass_delivered() {
        let s = spf_setup(SpfVerdict::Pass);
        seed_contact(&s.directory).await;

        assert_eq!(
            s.engine.handle(&reply_envelope_from_ip()).await,
            Status::accepted()
        );
        assert_eq!(s.transport.sent().len(), 1);
        assert_eq!(s.notifier.sent_count("spf_failed", "me@real.example"), 0);
    }

    #[tokio::test]
    async fn test_reply_spam_deletes_log() {
        let s = setup();
        seed_contact(&s.directory).await;
        // over the fixed reply threshold, under any forward threshold
        let engine = s.engine.with_scorer(Arc::new(StubScorer::new(20.0)));

        assert_eq!(
            engine.handle(&reply_envelope()).await,
            Status::reply_spam_detected()
        );
        assert!(s.transport.sent().is_empty());
        assert!(s.directory.delivery_logs().is_empty());
        assert_eq!(s.directory.quarantined_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_below_fixed_threshold_delivered() {
        let s = setup();
        seed_contact(&s.directory).await;
        // would be spam in the forward phase, fine for a reply
        let engine = s.engine.with_scorer(Arc::new(StubScorer::new(9.0)));

        assert_eq!(engine.handle(&reply_envelope()).await, Status::accepted());
    }

    #[tokio::test]
    async fn test_reply_replaces_reverse_alias_in_body_on_opt_in() {
        let s = setup();
        seed_contact(&s.directory).await;
        let mut user = User::new(1, "owner@real.example");
        user.replace_reverse_alias = true;
        s.directory.seed_user(user);

        s.engine.handle(&reply_envelope()).await;

        let raw = &s.transport.sent()[0].raw;
        assert!(raw.contains("reply body with boss@corp.example inside"));
        assert!(!raw.contains("ra+bosstoken"));
    }

    #[tokio::test]
    async fn test_reply_encrypts_for_pgp_contact() {
        let s = setup();
        let mut contact = seed_contact(&s.directory).await;
        contact.pgp = Some(PgpKey {
            fingerprint: "ABCD".to_string(),
            public_key: "key".to_string(),
        });
        s.directory.update_contact(contact).await.unwrap();
        let mut user = User::new(1, "owner@real.example");
        user.premium = true;
        s.directory.seed_user(user);
        let engine = s.engine.with_encryptor(Arc::new(StubEncryptor::new()));

        assert_eq!(engine.handle(&reply_envelope()).await, Status::accepted());
        let raw = &s.transport.sent()[0].raw;
        assert!(raw.contains("multipart/encrypted"));
        assert!(!raw.contains("reply body"));
    }

    #[tokio::test]
    async fn test_reply_transport_failure_still_succeeds() {
        let s = setup();
        seed_contact(&s.directory).await;
        s.transport.reject("boss@corp.example");

        assert_eq!(s.engine.handle(&reply_envelope()).await, Status::accepted());
        assert_eq!(
            s.notifier
                .sent_count("reply_delivery_failed", "me@real.example"),
            1
        );
    }
}
