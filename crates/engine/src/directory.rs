//! Alias/contact/mailbox directory contract and records.
//!
//! The engine never owns persistence: it reads aliases, mailboxes, contacts
//! and users through the [`Directory`] trait and appends delivery logs,
//! bounce counters and quarantined messages. Each call is atomic at the
//! single-row level; multi-step handler sequences are deliberately not
//! transactional across calls, so an earlier committed side effect stands
//! even when a later step fails.
//!
//! [`MemoryDirectory`] is the in-crate implementation, used by tests and
//! single-node deployments.

use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Mutex,
};

use chrono::{DateTime, Utc};

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Boxed future type for directory operations, enabling object safety.
pub type DirectoryFuture<'a, T> =
    Pin<Box<dyn Future<Output = DirectoryResult<T>> + Send + 'a>>;

/// Errors that can occur during directory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// A referenced record does not exist.
    NotFound,
    /// A uniqueness constraint was violated; the caller should re-read.
    Conflict,
    /// The backing store failed.
    Storage(String),
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NotFound => write!(f, "Record not found"),
            DirectoryError::Conflict => write!(f, "Uniqueness conflict"),
            DirectoryError::Storage(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// PGP key material registered for a mailbox or contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpKey {
    pub fingerprint: String,
    pub public_key: String,
}

/// An account owning aliases and mailboxes.
#[derive(Debug, Clone)]
pub struct User {
    pub id: u64,
    pub address: String,
    pub disabled: bool,
    /// Plan gate: payload encryption is only performed for premium users.
    pub premium: bool,
    /// Forward-phase spam threshold override.
    pub max_spam_score: Option<f32>,
    /// Replace the reverse-alias literal in reply bodies with the contact's
    /// real address.
    pub replace_reverse_alias: bool,
    pub notifications_enabled: bool,
}

impl User {
    pub fn new(id: u64, address: &str) -> Self {
        Self {
            id,
            address: address.to_string(),
            disabled: false,
            premium: false,
            max_spam_score: None,
            replace_reverse_alias: false,
            notifications_enabled: true,
        }
    }
}

/// A published address forwarding to one or more real mailboxes.
#[derive(Debug, Clone)]
pub struct Alias {
    pub id: u64,
    pub address: String,
    pub user_id: u64,
    pub enabled: bool,
    /// Optional display name used when rewriting reply From headers.
    pub name: Option<String>,
    /// Destination mailboxes, in priority order. An enabled alias with no
    /// mailbox fails closed.
    pub mailbox_ids: Vec<u64>,
    pub disable_pgp: bool,
    pub disable_spoofing_check: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Alias {
    pub fn new(id: u64, address: &str, user_id: u64, mailbox_ids: Vec<u64>) -> Self {
        Self {
            id,
            address: address.to_string(),
            user_id,
            enabled: true,
            name: None,
            mailbox_ids,
            disable_pgp: false,
            disable_spoofing_check: false,
            deleted_at: None,
        }
    }
}

/// A real destination address owned by a user.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: u64,
    pub address: String,
    pub verified: bool,
    pub disabled: bool,
    pub pgp: Option<PgpKey>,
    /// Subject override applied when the payload is encrypted.
    pub generic_subject: Option<String>,
    /// Additional addresses allowed to send through this mailbox's aliases.
    pub authorized_addresses: Vec<String>,
    /// Require SPF to pass for reply-phase mail from this mailbox.
    pub force_spf: bool,
}

impl Mailbox {
    pub fn new(id: u64, address: &str) -> Self {
        Self {
            id,
            address: address.to_string(),
            verified: true,
            disabled: false,
            pgp: None,
            generic_subject: None,
            authorized_addresses: Vec::new(),
            force_spf: false,
        }
    }
}

/// A per-alias record of one external party.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: u64,
    pub alias_id: u64,
    pub user_id: u64,
    /// The external party's address; empty when it could not be parsed
    /// (the contact is then flagged invalid).
    pub address: String,
    pub name: Option<String>,
    /// Original raw From header, kept for audit.
    pub raw_from_header: Option<String>,
    /// Original envelope sender, kept for audit.
    pub raw_envelope_from: Option<String>,
    /// Globally unique generated reverse-alias address; immutable once
    /// created.
    pub reverse_alias: String,
    pub pgp: Option<PgpKey>,
    pub is_cc: bool,
    pub blocked: bool,
    pub invalid: bool,
}

impl Contact {
    /// The contact's reverse alias formatted with its display name, used
    /// when rewriting From/To/Cc in the forward phase.
    pub fn reverse_alias_with_name(&self) -> String {
        crate::address::format_address(self.name.as_deref().unwrap_or(""), &self.reverse_alias)
    }

    /// The contact's real address formatted with its display name, used
    /// when rewriting headers in the reply phase.
    pub fn address_with_name(&self) -> String {
        crate::address::format_address(self.name.as_deref().unwrap_or(""), &self.address)
    }
}

/// Input for [`Directory::create_contact`].
#[derive(Debug, Clone)]
pub struct NewContact {
    pub alias_id: u64,
    pub user_id: u64,
    pub address: String,
    pub name: Option<String>,
    pub raw_from_header: Option<String>,
    pub raw_envelope_from: Option<String>,
    pub reverse_alias: String,
    pub is_cc: bool,
    pub invalid: bool,
}

/// A persisted record of one delivery attempt. Created once per attempt;
/// only terminal-state flags are appended afterwards.
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    pub id: u64,
    pub contact_id: u64,
    pub user_id: u64,
    pub mailbox_id: Option<u64>,
    pub is_reply: bool,
    pub blocked: bool,
    pub bounced: bool,
    pub auto_replied: bool,
    pub is_spam: bool,
    pub spam_score: Option<f32>,
    pub quarantine_id: Option<u64>,
}

/// Input for [`Directory::create_delivery_log`].
#[derive(Debug, Clone, Default)]
pub struct NewDeliveryLog {
    pub contact_id: u64,
    pub user_id: u64,
    pub mailbox_id: Option<u64>,
    pub is_reply: bool,
    pub blocked: bool,
}

/// Why a message was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    Bounce,
    Spam,
    Cycle,
}

impl Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuarantineReason::Bounce => write!(f, "bounce"),
            QuarantineReason::Spam => write!(f, "spam"),
            QuarantineReason::Cycle => write!(f, "cycle"),
        }
    }
}

/// Blob + metadata for a blocked, bounced or spam-flagged message,
/// inspected later through the administrative surface.
#[derive(Debug, Clone)]
pub struct QuarantinedMessage {
    pub id: u64,
    pub user_id: u64,
    pub reason: QuarantineReason,
    /// Full message as received (bounce report included, when applicable).
    pub blob: String,
    /// Original message extracted from a bounce/spam report, when one could
    /// be recovered.
    pub original_blob: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lookup and append contract the engine consumes.
///
/// Uses the boxed-future pattern for object safety; implementations may be
/// backed by any store. Lookups return `Ok(None)` for absent records and
/// reserve errors for storage faults.
pub trait Directory: Send + Sync {
    fn get_user<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<User>>;

    fn get_alias<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Alias>>;

    fn get_alias_by_address<'a>(&'a self, address: &'a str)
        -> DirectoryFuture<'a, Option<Alias>>;

    /// Auto-provisioning hook for aliases that do not exist yet (directory
    /// pattern rules, catch-all domains). `Ok(None)` when the address
    /// cannot be provisioned.
    fn auto_create_alias<'a>(&'a self, address: &'a str)
        -> DirectoryFuture<'a, Option<Alias>>;

    fn get_mailbox<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Mailbox>>;

    fn get_contact<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Contact>>;

    fn get_contact_by_reverse_alias<'a>(
        &'a self,
        reverse_alias: &'a str,
    ) -> DirectoryFuture<'a, Option<Contact>>;

    fn get_contact_by_alias_and_address<'a>(
        &'a self,
        alias_id: u64,
        address: &'a str,
    ) -> DirectoryFuture<'a, Option<Contact>>;

    /// Creates a contact. Fails with [`DirectoryError::Conflict`] when the
    /// (alias, address) pair or the reverse alias already exists; callers
    /// resolve the conflict by re-reading.
    fn create_contact<'a>(&'a self, contact: NewContact) -> DirectoryFuture<'a, Contact>;

    /// Best-effort update of mutable contact fields (display name, audit
    /// strings). The reverse alias is immutable.
    fn update_contact<'a>(&'a self, contact: Contact) -> DirectoryFuture<'a, ()>;

    fn create_delivery_log<'a>(
        &'a self,
        log: NewDeliveryLog,
    ) -> DirectoryFuture<'a, DeliveryLog>;

    fn update_delivery_log<'a>(&'a self, log: DeliveryLog) -> DirectoryFuture<'a, ()>;

    /// Removes a delivery log, used when a reply was blocked as spam and
    /// must not pollute bounce tracking.
    fn delete_delivery_log<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()>;

    fn get_delivery_log<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<DeliveryLog>>;

    fn disable_alias<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()>;

    fn disable_user_notifications<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()>;

    /// Appends a standalone bounce-count entry keyed by address.
    fn record_bounce<'a>(&'a self, address: &'a str) -> DirectoryFuture<'a, ()>;

    /// External disable policy: whether an alias has accumulated enough
    /// bounces/complaints to be switched off.
    fn should_disable_alias<'a>(&'a self, alias_id: u64) -> DirectoryFuture<'a, bool>;

    fn create_quarantined_message<'a>(
        &'a self,
        user_id: u64,
        reason: QuarantineReason,
        blob: String,
        original_blob: Option<String>,
    ) -> DirectoryFuture<'a, QuarantinedMessage>;

    /// Resolves the address a transactional email was sent to, for
    /// transactional bounce accounting.
    fn get_transactional_address<'a>(&'a self, id: u64)
        -> DirectoryFuture<'a, Option<String>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    users: HashMap<u64, User>,
    aliases: HashMap<u64, Alias>,
    mailboxes: HashMap<u64, Mailbox>,
    contacts: HashMap<u64, Contact>,
    logs: HashMap<u64, DeliveryLog>,
    quarantined: HashMap<u64, QuarantinedMessage>,
    bounces: HashMap<String, u32>,
    transactional: HashMap<u64, String>,
    next_contact_id: u64,
    next_log_id: u64,
    next_quarantine_id: u64,
}

/// In-memory [`Directory`] implementation.
///
/// Serializes through a `Mutex` at single-call granularity, which gives the
/// row-level atomicity the contract requires. The disable policy counts
/// bounced delivery logs per alias against a fixed threshold.
pub struct MemoryDirectory {
    inner: Mutex<MemoryInner>,
    bounce_disable_threshold: u32,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_bounce_threshold(5)
    }

    /// Directory whose disable policy fires once an alias accumulates
    /// `threshold` bounced deliveries.
    pub fn with_bounce_threshold(threshold: u32) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                next_contact_id: 1,
                next_log_id: 1,
                next_quarantine_id: 1,
                ..Default::default()
            }),
            bounce_disable_threshold: threshold,
        }
    }

    pub fn seed_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    pub fn seed_alias(&self, alias: Alias) {
        self.lock().aliases.insert(alias.id, alias);
    }

    pub fn seed_mailbox(&self, mailbox: Mailbox) {
        self.lock().mailboxes.insert(mailbox.id, mailbox);
    }

    pub fn seed_transactional(&self, id: u64, address: &str) {
        self.lock().transactional.insert(id, address.to_string());
    }

    /// Number of bounce-count entries recorded for an address.
    pub fn bounce_count(&self, address: &str) -> u32 {
        self.lock().bounces.get(address).copied().unwrap_or(0)
    }

    /// All quarantined messages, newest last.
    pub fn quarantined_messages(&self) -> Vec<QuarantinedMessage> {
        let mut msgs: Vec<_> = self.lock().quarantined.values().cloned().collect();
        msgs.sort_by_key(|m| m.id);
        msgs
    }

    /// All delivery logs, oldest first.
    pub fn delivery_logs(&self) -> Vec<DeliveryLog> {
        let mut logs: Vec<_> = self.lock().logs.values().cloned().collect();
        logs.sort_by_key(|l| l.id);
        logs
    }

    /// All contacts of an alias, oldest first.
    pub fn contacts_of_alias(&self, alias_id: u64) -> Vec<Contact> {
        let mut contacts: Vec<_> = self
            .lock()
            .contacts
            .values()
            .filter(|c| c.alias_id == alias_id)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| c.id);
        contacts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // a poisoned lock means a panicked test; propagate the panic
        self.inner.lock().expect("memory directory lock poisoned")
    }
}

impl Directory for MemoryDirectory {
    fn get_user<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<User>> {
        Box::pin(async move { Ok(self.lock().users.get(&id).cloned()) })
    }

    fn get_alias<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Alias>> {
        Box::pin(async move { Ok(self.lock().aliases.get(&id).cloned()) })
    }

    fn get_alias_by_address<'a>(
        &'a self,
        address: &'a str,
    ) -> DirectoryFuture<'a, Option<Alias>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .aliases
                .values()
                .find(|a| a.address == address)
                .cloned())
        })
    }

    fn auto_create_alias<'a>(&'a self, _address: &'a str) -> DirectoryFuture<'a, Option<Alias>> {
        // no directory pattern rules in the in-memory store
        Box::pin(async move { Ok(None) })
    }

    fn get_mailbox<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Mailbox>> {
        Box::pin(async move { Ok(self.lock().mailboxes.get(&id).cloned()) })
    }

    fn get_contact<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<Contact>> {
        Box::pin(async move { Ok(self.lock().contacts.get(&id).cloned()) })
    }

    fn get_contact_by_reverse_alias<'a>(
        &'a self,
        reverse_alias: &'a str,
    ) -> DirectoryFuture<'a, Option<Contact>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .contacts
                .values()
                .find(|c| c.reverse_alias == reverse_alias)
                .cloned())
        })
    }

    fn get_contact_by_alias_and_address<'a>(
        &'a self,
        alias_id: u64,
        address: &'a str,
    ) -> DirectoryFuture<'a, Option<Contact>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .contacts
                .values()
                .find(|c| c.alias_id == alias_id && c.address == address)
                .cloned())
        })
    }

    fn create_contact<'a>(&'a self, contact: NewContact) -> DirectoryFuture<'a, Contact> {
        Box::pin(async move {
            let mut inner = self.lock();
            // invalid contacts share the no-reply sink as reverse alias, so
            // the uniqueness constraint only covers generated ones
            let duplicate = inner.contacts.values().any(|c| {
                (c.alias_id == contact.alias_id && c.address == contact.address)
                    || (!contact.invalid && c.reverse_alias == contact.reverse_alias)
            });
            if duplicate {
                return Err(DirectoryError::Conflict);
            }
            let id = inner.next_contact_id;
            inner.next_contact_id += 1;
            let created = Contact {
                id,
                alias_id: contact.alias_id,
                user_id: contact.user_id,
                address: contact.address,
                name: contact.name,
                raw_from_header: contact.raw_from_header,
                raw_envelope_from: contact.raw_envelope_from,
                reverse_alias: contact.reverse_alias,
                pgp: None,
                is_cc: contact.is_cc,
                blocked: false,
                invalid: contact.invalid,
            };
            inner.contacts.insert(id, created.clone());
            Ok(created)
        })
    }

    fn update_contact<'a>(&'a self, contact: Contact) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            match inner.contacts.get_mut(&contact.id) {
                Some(existing) => {
                    let reverse_alias = existing.reverse_alias.clone();
                    *existing = contact;
                    existing.reverse_alias = reverse_alias;
                    Ok(())
                }
                None => Err(DirectoryError::NotFound),
            }
        })
    }

    fn create_delivery_log<'a>(
        &'a self,
        log: NewDeliveryLog,
    ) -> DirectoryFuture<'a, DeliveryLog> {
        Box::pin(async move {
            let mut inner = self.lock();
            let id = inner.next_log_id;
            inner.next_log_id += 1;
            let created = DeliveryLog {
                id,
                contact_id: log.contact_id,
                user_id: log.user_id,
                mailbox_id: log.mailbox_id,
                is_reply: log.is_reply,
                blocked: log.blocked,
                bounced: false,
                auto_replied: false,
                is_spam: false,
                spam_score: None,
                quarantine_id: None,
            };
            inner.logs.insert(id, created.clone());
            Ok(created)
        })
    }

    fn update_delivery_log<'a>(&'a self, log: DeliveryLog) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            match inner.logs.get_mut(&log.id) {
                Some(existing) => {
                    *existing = log;
                    Ok(())
                }
                None => Err(DirectoryError::NotFound),
            }
        })
    }

    fn delete_delivery_log<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            self.lock().logs.remove(&id);
            Ok(())
        })
    }

    fn get_delivery_log<'a>(&'a self, id: u64) -> DirectoryFuture<'a, Option<DeliveryLog>> {
        Box::pin(async move { Ok(self.lock().logs.get(&id).cloned()) })
    }

    fn disable_alias<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            match inner.aliases.get_mut(&id) {
                Some(alias) => {
                    alias.enabled = false;
                    Ok(())
                }
                None => Err(DirectoryError::NotFound),
            }
        })
    }

    fn disable_user_notifications<'a>(&'a self, id: u64) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            match inner.users.get_mut(&id) {
                Some(user) => {
                    user.notifications_enabled = false;
                    Ok(())
                }
                None => Err(DirectoryError::NotFound),
            }
        })
    }

    fn record_bounce<'a>(&'a self, address: &'a str) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            *self.lock().bounces.entry(address.to_string()).or_insert(0) += 1;
            Ok(())
        })
    }

    fn should_disable_alias<'a>(&'a self, alias_id: u64) -> DirectoryFuture<'a, bool> {
        Box::pin(async move {
            let inner = self.lock();
            let contact_ids: Vec<u64> = inner
                .contacts
                .values()
                .filter(|c| c.alias_id == alias_id)
                .map(|c| c.id)
                .collect();
            let bounced = inner
                .logs
                .values()
                .filter(|l| l.bounced && contact_ids.contains(&l.contact_id))
                .count() as u32;
            Ok(bounced >= self.bounce_disable_threshold)
        })
    }

    fn create_quarantined_message<'a>(
        &'a self,
        user_id: u64,
        reason: QuarantineReason,
        blob: String,
        original_blob: Option<String>,
    ) -> DirectoryFuture<'a, QuarantinedMessage> {
        Box::pin(async move {
            let mut inner = self.lock();
            let id = inner.next_quarantine_id;
            inner.next_quarantine_id += 1;
            let created = QuarantinedMessage {
                id,
                user_id,
                reason,
                blob,
                original_blob,
                created_at: Utc::now(),
            };
            inner.quarantined.insert(id, created.clone());
            Ok(created)
        })
    }

    fn get_transactional_address<'a>(
        &'a self,
        id: u64,
    ) -> DirectoryFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.lock().transactional.get(&id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_contact(alias_id: u64, address: &str, reverse_alias: &str) -> NewContact {
        NewContact {
            alias_id,
            user_id: 1,
            address: address.to_string(),
            name: None,
            raw_from_header: None,
            raw_envelope_from: None,
            reverse_alias: reverse_alias.to_string(),
            is_cc: false,
            invalid: false,
        }
    }

    #[tokio::test]
    async fn test_create_contact_conflict_on_duplicate_pair() {
        let dir = MemoryDirectory::new();

        dir.create_contact(new_contact(1, "boss@corp.example", "ra+a@veil.example"))
            .await
            .unwrap();
        let err = dir
            .create_contact(new_contact(1, "boss@corp.example", "ra+b@veil.example"))
            .await
            .unwrap_err();

        assert_eq!(err, DirectoryError::Conflict);

        // conflict is resolved by re-reading the existing record
        let existing = dir
            .get_contact_by_alias_and_address(1, "boss@corp.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(existing.reverse_alias, "ra+a@veil.example");
    }

    #[tokio::test]
    async fn test_create_contact_conflict_on_duplicate_reverse_alias() {
        let dir = MemoryDirectory::new();

        dir.create_contact(new_contact(1, "a@corp.example", "ra+same@veil.example"))
            .await
            .unwrap();
        let err = dir
            .create_contact(new_contact(2, "b@corp.example", "ra+same@veil.example"))
            .await
            .unwrap_err();

        assert_eq!(err, DirectoryError::Conflict);
    }

    #[tokio::test]
    async fn test_update_contact_keeps_reverse_alias_immutable() {
        let dir = MemoryDirectory::new();

        let mut contact = dir
            .create_contact(new_contact(1, "boss@corp.example", "ra+a@veil.example"))
            .await
            .unwrap();
        contact.name = Some("Boss".to_string());
        contact.reverse_alias = "ra+tampered@veil.example".to_string();
        dir.update_contact(contact.clone()).await.unwrap();

        let stored = dir
            .get_contact_by_alias_and_address(1, "boss@corp.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name.as_deref(), Some("Boss"));
        assert_eq!(stored.reverse_alias, "ra+a@veil.example");
    }

    #[tokio::test]
    async fn test_delivery_log_lifecycle() {
        let dir = MemoryDirectory::new();

        let log = dir
            .create_delivery_log(NewDeliveryLog {
                contact_id: 1,
                user_id: 1,
                mailbox_id: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!log.bounced);

        let mut updated = log.clone();
        updated.bounced = true;
        dir.update_delivery_log(updated).await.unwrap();
        assert!(dir.get_delivery_log(log.id).await.unwrap().unwrap().bounced);

        dir.delete_delivery_log(log.id).await.unwrap();
        assert!(dir.get_delivery_log(log.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_disable_alias_counts_bounced_logs() {
        let dir = MemoryDirectory::with_bounce_threshold(2);

        let contact = dir
            .create_contact(new_contact(7, "c@corp.example", "ra+c@veil.example"))
            .await
            .unwrap();

        assert!(!dir.should_disable_alias(7).await.unwrap());

        for _ in 0..2 {
            let log = dir
                .create_delivery_log(NewDeliveryLog {
                    contact_id: contact.id,
                    user_id: 1,
                    ..Default::default()
                })
                .await
                .unwrap();
            let mut bounced = log.clone();
            bounced.bounced = true;
            dir.update_delivery_log(bounced).await.unwrap();
        }

        assert!(dir.should_disable_alias(7).await.unwrap());
        assert!(!dir.should_disable_alias(8).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_bounce_counts_per_address() {
        let dir = MemoryDirectory::new();

        dir.record_bounce("me@real.example").await.unwrap();
        dir.record_bounce("me@real.example").await.unwrap();

        assert_eq!(dir.bounce_count("me@real.example"), 2);
        assert_eq!(dir.bounce_count("other@real.example"), 0);
    }

    #[tokio::test]
    async fn test_disable_alias() {
        let dir = MemoryDirectory::new();
        dir.seed_alias(Alias::new(3, "news@veil.example", 1, vec![]));

        dir.disable_alias(3).await.unwrap();

        assert!(!dir.get_alias(3).await.unwrap().unwrap().enabled);
        assert_eq!(dir.disable_alias(99).await.unwrap_err(), DirectoryError::NotFound);
    }
}
