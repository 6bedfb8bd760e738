//! Phase classifier and envelope dispatcher.
//!
//! One [`Engine`] instance serves the whole process; every collaborator is
//! injected at construction and shared behind `Arc`, so envelopes can be
//! handled concurrently from independent tasks. [`Engine::handle`] is the
//! single entry point: one envelope in, one status line out.

use std::{fmt::Display, sync::Arc};

use tracing::{info, warn};

use crate::{
    address,
    config::EngineConfig,
    directory::{Directory, DirectoryError},
    encrypt::Encryptor,
    message::Envelope,
    notify::{Notification, Notifier},
    spam::{SpamError, SpamScorer},
    status::{self, Status},
    transform::{Signer, SpfVerifier},
    transport::Transport,
};

/// Internal faults that abort an envelope. Never surfaced as-is: the
/// top-level handler converts them into a generic temporary failure so the
/// upstream transport retries once the fault is fixed.
#[derive(Debug)]
pub enum EngineError {
    Directory(DirectoryError),
    Spam(SpamError),
    Transport(std::io::Error),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Directory(e) => write!(f, "Directory fault: {e}"),
            EngineError::Spam(e) => write!(f, "Spam gate fault: {e}"),
            EngineError::Transport(e) => write!(f, "Transport fault: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DirectoryError> for EngineError {
    fn from(e: DirectoryError) -> Self {
        EngineError::Directory(e)
    }
}

impl From<SpamError> for EngineError {
    fn from(e: SpamError) -> Self {
        EngineError::Spam(e)
    }
}

/// The relay engine: classifies each envelope into a phase and runs the
/// matching handler.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) scorer: Option<Arc<dyn SpamScorer>>,
    pub(crate) encryptor: Option<Arc<dyn Encryptor>>,
    pub(crate) signer: Option<Arc<dyn Signer>>,
    pub(crate) spf: Option<Arc<dyn SpfVerifier>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            directory,
            transport,
            notifier,
            scorer: None,
            encryptor: None,
            signer: None,
            spf: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SpamScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_spf_verifier(mut self, spf: Arc<dyn SpfVerifier>) -> Self {
        self.spf = Some(spf);
        self
    }

    /// Handles one envelope end to end and returns the protocol status
    /// line. Never fails: internal faults degrade to a temporary failure so
    /// the connection layer stays healthy.
    pub async fn handle(&self, envelope: &Envelope) -> Status {
        match self.dispatch(envelope).await {
            Ok(status) => {
                info!(
                    from = %envelope.from,
                    rcpts = envelope.rcpts.len(),
                    status = %status,
                    "envelope handled"
                );
                status
            }
            Err(e) => {
                warn!(from = %envelope.from, error = %e, "envelope handling failed");
                Status::temporary_failure()
            }
        }
    }

    async fn dispatch(&self, envelope: &Envelope) -> Result<Status, EngineError> {
        let from = address::normalize(&envelope.from);
        let rcpts: Vec<String> = envelope.rcpts.iter().map(|r| address::normalize(r)).collect();

        // a contact's reverse alias must never appear as a sender
        if address::is_reverse_alias(&from) {
            if let Some(contact) = self.directory.get_contact_by_reverse_alias(&from).await? {
                warn!(from = %from, "reverse alias used as envelope sender");
                // the alias owner is told out of band; the rejection itself
                // stays a drop so no bounce travels toward the contact
                if let Some(alias) = self.directory.get_alias(contact.alias_id).await? {
                    if let Some(user) = self.directory.get_user(alias.user_id).await? {
                        self.notifier
                            .notify(Notification::ReverseAliasSender {
                                recipient: user.address.clone(),
                                alias: alias.address.clone(),
                            })
                            .await;
                    }
                }
                return Ok(Status::reverse_alias_sender());
            }
        }

        // fixed single-recipient phases
        if let [rcpt] = rcpts.as_slice() {
            if self.config.unsubscribe_address.as_deref() == Some(rcpt.as_str()) {
                return self.handle_unsubscribe(envelope, rcpt).await;
            }
            if address::is_transactional_bounce_address(rcpt, &self.config.domain) {
                return self.handle_transactional_bounce(rcpt).await;
            }
            if address::is_bounce_address(rcpt, &self.config.domain) {
                return self.handle_bounce(envelope, rcpt).await;
            }
        }

        // per-recipient fan-out; recipients do not share failure state
        let noreply = self.config.noreply();
        let mut outcomes = Vec::with_capacity(rcpts.len());
        for rcpt in &rcpts {
            let outcome = if *rcpt == noreply {
                Status::noreply_recipient()
            } else if address::is_reverse_alias(rcpt) {
                self.handle_reply(envelope, rcpt).await?
            } else {
                self.handle_forward(envelope, rcpt).await?
            };
            outcomes.push(outcome);
        }
        Ok(status::reduce(&outcomes))
    }

    /// Bounce of a transactional email: only a standalone bounce-count
    /// entry is recorded, keyed by the address the email was sent to.
    async fn handle_transactional_bounce(&self, rcpt: &str) -> Result<Status, EngineError> {
        let Some(id) = address::decode_transactional_bounce_id(rcpt, &self.config.domain) else {
            warn!(rcpt = %rcpt, "malformed transactional bounce address");
            return Ok(Status::bounce_recorded());
        };
        match self.directory.get_transactional_address(id).await? {
            Some(target) => {
                self.directory.record_bounce(&target).await?;
                info!(transactional_id = id, address = %target, "transactional bounce recorded");
            }
            None => {
                warn!(transactional_id = id, "bounce for unknown transactional email");
            }
        }
        Ok(Status::bounce_recorded())
    }
}
