//! Invite link extraction and normalization.
//!
//! Short and canonical forms of one invite collapse to a single key:
//! `https://t.me/joinchat/ABC`, `t.me/+ABC` and `telegram.me/joinchat/ABC/`
//! all normalize to `t.me/+ABC`. Invite hashes keep their case; public
//! usernames are lowercased.

use std::sync::LazyLock;

use regex::Regex;

use crate::target::is_invite_hash;

static INVITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:https?://)?(?:www\.)?(?:t|telegram)\.(?:me|dog)/(?:joinchat/|\+)?[A-Za-z0-9_-]+/?",
    )
    .expect("valid invite regex")
});

/// Paths on t.me that are never a chat.
const RESERVED_PATHS: [&str; 12] = [
    "joinchat",
    "addstickers",
    "addemoji",
    "addtheme",
    "setlanguage",
    "share",
    "proxy",
    "socks",
    "iv",
    "login",
    "c",
    "s",
];

/// A normalized invite or public chat link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InviteLink {
    key: String,
}

impl InviteLink {
    /// Normalize a raw link; `Err` carries the reason it is malformed.
    pub fn parse(raw: &str) -> Result<Self, String> {
        normalize_invite_link(raw).map(|key| Self { key })
    }

    /// Identity key, e.g. `t.me/+ABC` or `t.me/somechannel`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> String {
        format!("https://{}", self.key)
    }

    pub fn is_private(&self) -> bool {
        self.key.starts_with("t.me/+")
    }
}

/// A link-like fragment found in text, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCandidate {
    pub raw: String,
    pub parsed: Result<InviteLink, String>,
}

/// Find every t.me-style link in `text`, in order of appearance.
pub fn extract_invite_links(text: &str) -> Vec<LinkCandidate> {
    INVITE_RE
        .find_iter(text)
        .map(|m| {
            let raw = m.as_str().trim_end_matches(['.', ',', ')']).to_string();
            let parsed = InviteLink::parse(&raw);
            LinkCandidate { raw, parsed }
        })
        .collect()
}

/// Normalize to `t.me/+<hash>` or `t.me/<username>`.
pub fn normalize_invite_link(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().trim_end_matches(['.', ',', ')', '/']);
    let lower = trimmed.to_ascii_lowercase();

    let mut rest_start = 0;
    for scheme in ["https://", "http://"] {
        if lower.starts_with(scheme) {
            rest_start = scheme.len();
            break;
        }
    }
    if lower[rest_start..].starts_with("www.") {
        rest_start += "www.".len();
    }

    let rest = &trimmed[rest_start..];
    let rest_lower = &lower[rest_start..];
    let host_len = ["t.me/", "telegram.me/", "telegram.dog/"]
        .iter()
        .find(|host| rest_lower.starts_with(*host))
        .map(|host| host.len())
        .ok_or_else(|| format!("not a t.me link: {}", raw))?;

    let path = &rest[host_len..];
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [first, hash, ..] if first.eq_ignore_ascii_case("joinchat") => {
            if is_invite_hash(hash) {
                Ok(format!("t.me/+{}", hash))
            } else {
                Err(format!("bad invite hash in {}", raw))
            }
        }
        [first, ..] if first.starts_with('+') => {
            let hash = &first[1..];
            if is_invite_hash(hash) {
                Ok(format!("t.me/+{}", hash))
            } else {
                Err(format!("bad invite hash in {}", raw))
            }
        }
        [name] => {
            let name = name.to_ascii_lowercase();
            if RESERVED_PATHS.contains(&name.as_str()) {
                return Err(format!("'{}' is not a chat link", raw));
            }
            let valid = name.len() >= 4
                && name.len() <= 32
                && name.starts_with(|c: char| c.is_ascii_alphabetic())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if valid {
                Ok(format!("t.me/{}", name))
            } else {
                Err(format!("bad username in {}", raw))
            }
        }
        [] => Err(format!("empty link path in {}", raw)),
        _ => Err(format!("unexpected link shape {}", raw)),
    }
}
