//! Address codec for reverse-alias and bounce-tracking addresses.
//!
//! All functions here are pure: the classifier relies on the predicates
//! being cheap prefix/suffix checks with no directory lookup. Formats are
//! wire-visible and must stay stable:
//!
//! - reverse-alias: `ra+<token>@<domain>` (legacy `reply+` also recognized)
//! - delivery bounce: `bounce+<id>+@<domain>`
//! - transactional bounce: `transactional+<id>+@<domain>`

use rand::Rng;

/// Prefix of generated reverse-alias addresses.
pub const REVERSE_ALIAS_PREFIX: &str = "ra+";

/// Older deployments generated reverse aliases with this prefix; they stay
/// routable forever.
pub const LEGACY_REVERSE_ALIAS_PREFIX: &str = "reply+";

/// Prefix of VERP bounce-tracking addresses.
pub const BOUNCE_PREFIX: &str = "bounce+";

/// Prefix of transactional-email bounce addresses.
pub const TRANSACTIONAL_BOUNCE_PREFIX: &str = "transactional+";

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 16;

/// Canonicalizes an address for comparison and storage: surrounding
/// whitespace and angle brackets removed, lowercased. Idempotent.
pub fn normalize(address: &str) -> String {
    let mut trimmed = address.trim();
    // clients occasionally nest brackets when re-quoting an address
    while let Some(inner) = trimmed.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        trimmed = inner.trim();
    }
    trimmed.to_lowercase()
}

/// Returns the domain part of an address, empty when there is none.
pub fn domain_part(address: &str) -> &str {
    match address.rfind('@') {
        Some(pos) => &address[pos + 1..],
        None => "",
    }
}

/// Generates a fresh reverse-alias address under `domain`.
///
/// The token is random and unguessable; global uniqueness is enforced by
/// the directory's unique constraint, surfaced as a creation conflict.
pub fn encode_reverse_alias(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let token: String = (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect();
    format!("{REVERSE_ALIAS_PREFIX}{token}@{domain}")
}

/// Returns whether `address` looks like a reverse alias. Prefix check only;
/// the reply handler verifies the domain and resolves the contact.
pub fn is_reverse_alias(address: &str) -> bool {
    address.starts_with(REVERSE_ALIAS_PREFIX) || address.starts_with(LEGACY_REVERSE_ALIAS_PREFIX)
}

/// Re-canonicalizes a reverse alias that a mail client may have mangled:
/// any character outside the generated alphabet is mapped to `_`.
pub fn normalize_reverse_alias(address: &str) -> String {
    normalize(address)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '+' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Encodes the VERP envelope-from for one delivery attempt.
pub fn encode_bounce_address(delivery_log_id: u64, domain: &str) -> String {
    format!("{BOUNCE_PREFIX}{delivery_log_id}+@{domain}")
}

/// Returns whether `address` is a delivery bounce address for `domain`.
pub fn is_bounce_address(address: &str, domain: &str) -> bool {
    address.starts_with(BOUNCE_PREFIX) && address.ends_with(&format!("+@{domain}"))
}

/// Decodes the delivery-log id embedded in a bounce address.
/// Round-trips with [`encode_bounce_address`] for all valid ids.
pub fn decode_bounce_id(address: &str, domain: &str) -> Option<u64> {
    let suffix = format!("+@{domain}");
    address
        .strip_prefix(BOUNCE_PREFIX)?
        .strip_suffix(&suffix)?
        .parse()
        .ok()
}

/// Encodes the bounce address for a transactional email.
pub fn encode_transactional_bounce_address(transactional_id: u64, domain: &str) -> String {
    format!("{TRANSACTIONAL_BOUNCE_PREFIX}{transactional_id}+@{domain}")
}

/// Returns whether `address` is a transactional bounce address for `domain`.
pub fn is_transactional_bounce_address(address: &str, domain: &str) -> bool {
    address.starts_with(TRANSACTIONAL_BOUNCE_PREFIX) && address.ends_with(&format!("+@{domain}"))
}

/// Decodes the transactional-email id embedded in a bounce address.
pub fn decode_transactional_bounce_id(address: &str, domain: &str) -> Option<u64> {
    let suffix = format!("+@{domain}");
    address
        .strip_prefix(TRANSACTIONAL_BOUNCE_PREFIX)?
        .strip_suffix(&suffix)?
        .parse()
        .ok()
}

/// Lightweight validity check used before creating contacts: exactly one
/// `@` with a non-empty local part and a dotted domain.
pub fn is_valid_email(address: &str) -> bool {
    let mut parts = address.splitn(2, '@');
    let (local, domain) = match (parts.next(), parts.next()) {
        (Some(l), Some(d)) => (l, d),
        _ => return false,
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.contains(char::is_whitespace)
        && domain.matches('@').count() == 0
}

/// Parses an RFC 5322 address-list header value into `(display name,
/// address)` pairs. Handles quoted display names containing commas and
/// angle-bracketed addresses; malformed entries come back with an empty
/// address and are dropped by callers.
pub fn parse_address_list(value: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                let entry = std::mem::take(&mut current);
                if !entry.trim().is_empty() {
                    entries.push(entry);
                }
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current);
    }

    entries
        .iter()
        .map(|entry| parse_single_address(entry))
        .collect()
}

/// Parses one RFC 5322 mailbox into a `(display name, address)` pair, with
/// the address normalized.
pub fn parse_single_address(entry: &str) -> (String, String) {
    let entry = entry.trim();
    if let Some(open) = entry.rfind('<') {
        let close = entry[open..].find('>').map(|p| open + p);
        let addr = match close {
            Some(close) => &entry[open + 1..close],
            None => &entry[open + 1..],
        };
        let name = entry[..open].trim().trim_matches('"').trim();
        (name.to_string(), normalize(addr))
    } else {
        (String::new(), normalize(entry))
    }
}

/// Formats a display name and address as an RFC 5322 mailbox, quoting the
/// name when present.
pub fn format_address(name: &str, address: &str) -> String {
    if name.is_empty() {
        address.to_string()
    } else {
        format!("\"{}\" <{}>", name.replace('"', ""), address)
    }
}
