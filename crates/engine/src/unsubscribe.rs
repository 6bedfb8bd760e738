//! Unsubscribe phase: mail sent to the system-wide unsubscribe address.
//!
//! The target is carried in the Subject: `<alias id>=` (or a bare id)
//! disables that alias, `<user id>*` turns off the user's notification
//! email. The List-Unsubscribe header emitted on forwards pre-fills the
//! alias form, so one click from the user's mail client lands here.

use tracing::{info, warn};

use crate::{
    address,
    directory::Directory,
    engine::{Engine, EngineError},
    message::Envelope,
    notify::{Notification, Notifier},
    status::Status,
};

/// Parsed unsubscribe subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnsubscribeRequest {
    DisableAlias(u64),
    DisableNotifications(u64),
}

impl Engine {
    pub(crate) async fn handle_unsubscribe(
        &self,
        envelope: &Envelope,
        rcpt: &str,
    ) -> Result<Status, EngineError> {
        let message = envelope.to_message(rcpt);
        let Some(request) = parse_unsubscribe_subject(message.subject()) else {
            warn!(subject = %message.subject(), "malformed unsubscribe subject");
            return Ok(Status::malformed_unsubscribe());
        };

        let from = address::normalize(&envelope.from);
        match request {
            UnsubscribeRequest::DisableAlias(alias_id) => {
                self.disable_alias_request(alias_id, &from).await
            }
            UnsubscribeRequest::DisableNotifications(user_id) => {
                self.disable_notifications_request(user_id, &from).await
            }
        }
    }

    async fn disable_alias_request(
        &self,
        alias_id: u64,
        from: &str,
    ) -> Result<Status, EngineError> {
        let Some(alias) = self.directory.get_alias(alias_id).await? else {
            return Ok(Status::unsubscribe_no_such_alias());
        };

        // only the alias's own mailboxes may disable it
        let mut mailboxes = Vec::with_capacity(alias.mailbox_ids.len());
        for id in &alias.mailbox_ids {
            if let Some(mailbox) = self.directory.get_mailbox(*id).await? {
                mailboxes.push(mailbox);
            }
        }
        let authorized = mailboxes
            .iter()
            .any(|m| m.address == from || m.authorized_addresses.iter().any(|a| a == from));
        if !authorized {
            warn!(alias = %alias.address, sender = %from, "unauthorized unsubscribe sender");
            return Ok(Status::unsubscribe_unauthorized());
        }

        self.directory.disable_alias(alias.id).await?;
        info!(alias = %alias.address, "alias disabled by unsubscribe request");
        for mailbox in &mailboxes {
            self.notifier
                .notify(Notification::AliasDisabledByUnsubscribe {
                    recipient: mailbox.address.clone(),
                    alias: alias.address.clone(),
                })
                .await;
        }
        Ok(Status::unsubscribe_accepted())
    }

    async fn disable_notifications_request(
        &self,
        user_id: u64,
        from: &str,
    ) -> Result<Status, EngineError> {
        let Some(user) = self.directory.get_user(user_id).await? else {
            return Ok(Status::no_such_user());
        };
        if user.address != from {
            warn!(user = user.id, sender = %from, "unsubscribe sender is not the account owner");
            return Ok(Status::unsubscribe_wrong_sender());
        }

        self.directory.disable_user_notifications(user.id).await?;
        info!(user = user.id, "notifications disabled by unsubscribe request");
        self.notifier
            .notify(Notification::NotificationsDisabled {
                recipient: user.address.clone(),
            })
            .await;
        Ok(Status::unsubscribe_accepted())
    }
}

/// `"<id>="` or a bare id targets an alias; `"<id>*"` targets the user's
/// notification setting.
fn parse_unsubscribe_subject(subject: &str) -> Option<UnsubscribeRequest> {
    let subject = subject.trim();
    if let Some(id) = subject.strip_suffix('*') {
        return id.parse().ok().map(UnsubscribeRequest::DisableNotifications);
    }
    let id = subject.strip_suffix('=').unwrap_or(subject);
    id.parse().ok().map(UnsubscribeRequest::DisableAlias)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::EngineConfig,
        directory::{Alias, Mailbox, MemoryDirectory, User},
        notify::LogNotifier,
        testing::RecordingTransport,
    };

    struct Setup {
        engine: Engine,
        directory: Arc<MemoryDirectory>,
        notifier: Arc<LogNotifier>,
    }

    fn setup() -> Setup {
        let directory = Arc::new(MemoryDirectory::new());
        directory.seed_user(User::new(1, "owner@real.example"));
        directory.seed_mailbox(Mailbox::new(1, "me@real.example"));
        directory.seed_alias(Alias::new(1, "news@veil.example", 1, vec![1]));

        let notifier = Arc::new(LogNotifier::new());
        let mut config = EngineConfig::for_domain("veil.example");
        config.unsubscribe_address = Some("unsubscribe@veil.example".to_string());
        let engine = Engine::new(
            config,
            directory.clone(),
            Arc::new(RecordingTransport::new()),
            notifier.clone(),
        );
        Setup {
            engine,
            directory,
            notifier,
        }
    }

    fn unsubscribe_envelope(from: &str, subject: &str) -> Envelope {
        Envelope::new(
            from,
            vec!["unsubscribe@veil.example".to_string()],
            &format!("From: {from}\r\nSubject: {subject}\r\n\r\n\r\n"),
        )
    }

    #[test]
    fn test_parse_unsubscribe_subject() {
        assert_eq!(
            parse_unsubscribe_subject("12="),
            Some(UnsubscribeRequest::DisableAlias(12))
        );
        assert_eq!(
            parse_unsubscribe_subject(" 12 "),
            Some(UnsubscribeRequest::DisableAlias(12))
        );
        assert_eq!(
            parse_unsubscribe_subject("3*"),
            Some(UnsubscribeRequest::DisableNotifications(3))
        );
        assert_eq!(parse_unsubscribe_subject("nope"), None);
        assert_eq!(parse_unsubscribe_subject(""), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_disables_alias() {
        let s = setup();
        let envelope = unsubscribe_envelope("me@real.example", "1=");

        assert_eq!(s.engine.handle(&envelope).await, Status::unsubscribe_accepted());
        assert!(!s.directory.get_alias(1).await.unwrap().unwrap().enabled);
        assert_eq!(
            s.notifier
                .sent_count("alias_disabled_by_unsubscribe", "me@real.example"),
            1
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_rejects_foreign_sender() {
        let s = setup();
        let envelope = unsubscribe_envelope("stranger@evil.example", "1=");

        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::unsubscribe_unauthorized()
        );
        assert!(s.directory.get_alias(1).await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_alias() {
        let s = setup();
        let envelope = unsubscribe_envelope("me@real.example", "99=");
        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::unsubscribe_no_such_alias()
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_malformed_subject() {
        let s = setup();
        let envelope = unsubscribe_envelope("me@real.example", "whatever");
        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::malformed_unsubscribe()
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_disables_notifications_for_owner_only() {
        let s = setup();

        let envelope = unsubscribe_envelope("me@real.example", "1*");
        assert_eq!(
            s.engine.handle(&envelope).await,
            Status::unsubscribe_wrong_sender()
        );

        let envelope = unsubscribe_envelope("owner@real.example", "1*");
        assert_eq!(s.engine.handle(&envelope).await, Status::unsubscribe_accepted());
        assert!(
            !s.directory
                .get_user(1)
                .await
                .unwrap()
                .unwrap()
                .notifications_enabled
        );
        assert_eq!(
            s.notifier
                .sent_count("notifications_disabled", "owner@real.example"),
            1
        );
    }
}
