//! Collection targets: parsing user-supplied references and the resolved form.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W+").expect("valid regex"));

const TME_HOSTS: [&str; 4] = ["t.me/", "telegram.me/", "telegram.dog/", "www.t.me/"];

/// What kind of thing a target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Group,
    Channel,
    User,
    StickerPack,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Group => "group",
            TargetKind::Channel => "channel",
            TargetKind::User => "user",
            TargetKind::StickerPack => "sticker_pack",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unresolved reference as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// Private invite hash (`t.me/+hash`, `t.me/joinchat/hash`).
    Invite(String),
    /// Public username, without `@`.
    Username(String),
    /// Numeric id with any `-100` / `-` peer prefix removed.
    Id(i64),
}

impl TargetRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("empty target reference".to_string()));
        }

        if let Some(path) = tme_path(trimmed) {
            return Self::from_link_path(raw, path);
        }

        let name = trimmed.trim_start_matches('@');
        if let Some(id) = parse_peer_id(name) {
            return Ok(TargetRef::Id(id));
        }
        if let Some(hash) = name.strip_prefix('+') {
            if is_invite_hash(hash) {
                return Ok(TargetRef::Invite(hash.to_string()));
            }
        }
        if is_username(name) {
            return Ok(TargetRef::Username(name.to_string()));
        }

        Err(Error::InvalidArgument(format!(
            "'{}' is not a username, numeric id or t.me link",
            raw
        )))
    }

    fn from_link_path(raw: &str, path: &str) -> Result<Self> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next().unwrap_or_default();

        let parsed = if first == "joinchat" {
            segments
                .next()
                .filter(|h| is_invite_hash(h))
                .map(|h| TargetRef::Invite(h.to_string()))
        } else if let Some(hash) = first.strip_prefix('+') {
            Some(hash)
                .filter(|h| is_invite_hash(h))
                .map(|h| TargetRef::Invite(h.to_string()))
        } else if first == "c" {
            segments
                .next()
                .and_then(|id| id.parse::<i64>().ok())
                .map(TargetRef::Id)
        } else if first == "s" {
            segments
                .next()
                .filter(|n| is_username(n))
                .map(|n| TargetRef::Username(n.to_string()))
        } else if is_username(first) {
            Some(TargetRef::Username(first.to_string()))
        } else {
            None
        };

        parsed.ok_or_else(|| Error::InvalidArgument(format!("cannot parse link '{}'", raw)))
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Invite(hash) => write!(f, "t.me/+{}", hash),
            TargetRef::Username(name) => write!(f, "@{}", name),
            TargetRef::Id(id) => write!(f, "{}", id),
        }
    }
}

/// A resolved target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    reference: String,
    id: i64,
    kind: TargetKind,
    title: String,
}

impl Target {
    pub fn new(reference: impl Into<String>, id: i64, kind: TargetKind, title: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            id,
            kind,
            title: title.into(),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Stable key for checkpoints.
    pub fn key(&self) -> String {
        format!("{}_{}", self.kind, self.id)
    }

    /// File-name-safe label used in output paths.
    pub fn output_name(&self) -> String {
        let label = if self.title.trim().is_empty() {
            self.id.to_string()
        } else {
            self.title.clone()
        };
        safe_name(&label)
    }
}

/// Replace runs of non-word characters with `_`, trim, cap at 80 chars.
pub fn safe_name(input: &str) -> String {
    let replaced = NON_WORD.replace_all(input.trim(), "_");
    let trimmed: String = replaced.trim_matches('_').chars().take(80).collect();
    if trimmed.is_empty() {
        "target".to_string()
    } else {
        trimmed
    }
}

/// Sticker pack short name from `t.me/addstickers/<name>` or a bare name.
pub fn sticker_short_name(input: &str) -> Result<String> {
    let raw = input.trim();
    if let Some(path) = tme_path(raw) {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        return match parts.as_slice() {
            [_, name, ..] => Ok(name.to_string()),
            [name] => Ok(name.to_string()),
            [] => Err(Error::InvalidArgument(format!(
                "unable to parse sticker pack short name from URL: {}",
                input
            ))),
        };
    }
    raw.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument("empty sticker pack reference".to_string()))
}

/// Path after a `t.me`-style host, without scheme, query or fragment.
fn tme_path(raw: &str) -> Option<&str> {
    let without_scheme = ["https://", "http://"]
        .iter()
        .find(|scheme| {
            raw.get(..scheme.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
        })
        .map_or(raw, |scheme| &raw[scheme.len()..]);
    let lower = without_scheme.to_ascii_lowercase();
    let host_len = TME_HOSTS
        .iter()
        .find(|host| lower.starts_with(*host))
        .map(|host| host.len())?;
    let path = &without_scheme[host_len..];
    let end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
    Some(&path[..end])
}

fn parse_peer_id(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if raw.starts_with("-100") && raw.len() > 4 {
        return raw[4..].parse().ok();
    }
    digits.parse().ok()
}

fn is_username(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && (4..=32).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_invite_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_invite_forms() {
        assert_eq!(
            TargetRef::parse("https://t.me/joinchat/AbCdEf").unwrap(),
            TargetRef::Invite("AbCdEf".into())
        );
        assert_eq!(
            TargetRef::parse("t.me/+XyZ_12-3").unwrap(),
            TargetRef::Invite("XyZ_12-3".into())
        );
        assert_eq!(
            TargetRef::parse("+XyZ123").unwrap(),
            TargetRef::Invite("XyZ123".into())
        );
    }

    #[test]
    fn parses_usernames_and_links() {
        assert_eq!(
            TargetRef::parse("@durov").unwrap(),
            TargetRef::Username("durov".into())
        );
        assert_eq!(
            TargetRef::parse("https://t.me/rustlang/123").unwrap(),
            TargetRef::Username("rustlang".into())
        );
        assert_eq!(
            TargetRef::parse("t.me/s/rustlang").unwrap(),
            TargetRef::Username("rustlang".into())
        );
        assert_eq!(
            TargetRef::parse("telegram.me/rustlang?start=1").unwrap(),
            TargetRef::Username("rustlang".into())
        );
        assert_eq!(
            TargetRef::parse("HTTPS://T.me/rustlang").unwrap(),
            TargetRef::Username("rustlang".into())
        );
        assert_eq!(
            TargetRef::parse("Http://t.me/joinchat/AbCdEf").unwrap(),
            TargetRef::Invite("AbCdEf".into())
        );
    }

    #[test]
    fn parses_numeric_ids_with_peer_prefixes() {
        assert_eq!(TargetRef::parse("12345").unwrap(), TargetRef::Id(12345));
        assert_eq!(
            TargetRef::parse("-1001234567890").unwrap(),
            TargetRef::Id(1234567890)
        );
        assert_eq!(TargetRef::parse("-4242").unwrap(), TargetRef::Id(4242));
        assert_eq!(
            TargetRef::parse("https://t.me/c/1234567890/55").unwrap(),
            TargetRef::Id(1234567890)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(TargetRef::parse("").is_err());
        assert!(TargetRef::parse("t.me/joinchat/").is_err());
        assert!(TargetRef::parse("not a target!").is_err());
    }

    #[test]
    fn safe_name_matches_output_conventions() {
        assert_eq!(safe_name("Hello World!"), "Hello_World");
        assert_eq!(safe_name("  __x__  "), "x");
        assert_eq!(safe_name("!!!"), "target");
        assert_eq!(safe_name(&"a".repeat(200)).len(), 80);
    }

    #[test]
    fn target_key_and_output_name() {
        let target = Target::new("@chan", 777, TargetKind::Channel, "My Channel");
        assert_eq!(target.key(), "channel_777");
        assert_eq!(target.output_name(), "My_Channel");

        let untitled = Target::new("777", 777, TargetKind::Group, "");
        assert_eq!(untitled.output_name(), "777");
    }

    #[test]
    fn sticker_short_names() {
        assert_eq!(
            sticker_short_name("https://t.me/addstickers/HotCherry").unwrap(),
            "HotCherry"
        );
        assert_eq!(sticker_short_name("t.me/addstickers/Pack_1/").unwrap(), "Pack_1");
        assert_eq!(sticker_short_name("Animals extra words").unwrap(), "Animals");
        assert!(sticker_short_name("https://t.me/").is_err());
    }
}
