//! Collected entities and the raw shapes they are built from.
//!
//! Raw items are what the platform client hands back, with every field
//! optional. [`transform`] validates one item into a [`CollectedEntity`] or
//! reports why it cannot; the pipeline skips items that fail.

use chrono::{DateTime, Utc};

use crate::engine::dedup::IdentityKey;
use crate::invites::InviteLink;

/// Output stream a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionMode {
    Members,
    Messages,
    InviteLinks,
    Users,
    Stickers,
}

impl CollectionMode {
    /// Metrics and log label.
    pub fn label(&self) -> &'static str {
        match self {
            CollectionMode::Members => "members",
            CollectionMode::Messages => "messages",
            CollectionMode::InviteLinks => "invite_links",
            CollectionMode::Users => "users",
            CollectionMode::Stickers => "stickers",
        }
    }

    /// Sub-directory of the output root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CollectionMode::Members => "members",
            CollectionMode::Messages => "chats",
            CollectionMode::InviteLinks => "crawled_links",
            CollectionMode::Users => "users",
            CollectionMode::Stickers => "stickers",
        }
    }

    /// File name prefix.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            CollectionMode::Members => "members",
            CollectionMode::Messages => "messages",
            CollectionMode::InviteLinks => "crawled_links",
            CollectionMode::Users => "user",
            CollectionMode::Stickers => "sticker",
        }
    }

    pub fn header(&self) -> &'static [&'static str] {
        match self {
            CollectionMode::Members => &["user_id", "username", "name", "profile_link", "phone"],
            CollectionMode::Messages => &["message_id", "date", "sender", "text"],
            CollectionMode::InviteLinks => &["invite_link"],
            CollectionMode::Users => &["user_id", "username", "name", "phone", "profile_link"],
            CollectionMode::Stickers => &[
                "set_id",
                "short_name",
                "title",
                "count",
                "creator_id",
                "creator_username",
                "creator_name",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Sticker,
    Document,
    Other,
}

impl MediaKind {
    /// Stand-in text for a media-only message.
    pub fn placeholder(&self) -> &'static str {
        match self {
            MediaKind::Photo => "[Photo]",
            MediaKind::Sticker => "[Sticker]",
            MediaKind::Document => "[Document]",
            MediaKind::Other => "[Media]",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMember {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSender {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub id: Option<i64>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub media: Option<MediaKind>,
    pub sender: Option<RawSender>,
}

/// One item of a paged listing, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    Member(RawMember),
    Message(RawMessage),
}

impl RawItem {
    /// Dedup key, if the item carries one.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        match self {
            RawItem::Member(m) => m.id.map(IdentityKey::Id),
            RawItem::Message(m) => m.id.map(IdentityKey::Id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub user_id: i64,
    pub username: Option<String>,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub sender: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        full_name(self.first_name.as_deref(), self.last_name.as_deref())
    }

    pub fn profile_link(&self) -> Option<String> {
        self.username.as_deref().map(profile_link)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StickerPackInfo {
    pub set_id: i64,
    pub short_name: String,
    pub title: String,
    pub count: i32,
    pub creator_id: i64,
    /// Present only when the creator's profile resolves.
    pub creator: Option<UserProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectedEntity {
    Member(Member),
    Message(Message),
    InviteLink(InviteLink),
    UserProfile(UserProfile),
    StickerPackInfo(StickerPackInfo),
}

impl CollectedEntity {
    pub fn identity_key(&self) -> IdentityKey {
        match self {
            CollectedEntity::Member(m) => IdentityKey::Id(m.user_id),
            CollectedEntity::Message(m) => IdentityKey::Id(m.id),
            CollectedEntity::InviteLink(link) => IdentityKey::Link(link.key().to_string()),
            CollectedEntity::UserProfile(u) => IdentityKey::Id(u.id),
            CollectedEntity::StickerPackInfo(s) => IdentityKey::Id(s.set_id),
        }
    }

    pub fn mode(&self) -> CollectionMode {
        match self {
            CollectedEntity::Member(_) => CollectionMode::Members,
            CollectedEntity::Message(_) => CollectionMode::Messages,
            CollectedEntity::InviteLink(_) => CollectionMode::InviteLinks,
            CollectedEntity::UserProfile(_) => CollectionMode::Users,
            CollectedEntity::StickerPackInfo(_) => CollectionMode::Stickers,
        }
    }

    /// CSV fields, aligned with `mode().header()`.
    pub fn to_row(&self) -> Vec<String> {
        match self {
            CollectedEntity::Member(m) => vec![
                m.user_id.to_string(),
                m.username.clone().unwrap_or_default(),
                m.name.clone(),
                m.username.as_deref().map(profile_link).unwrap_or_default(),
                m.phone.clone().unwrap_or_default(),
            ],
            CollectedEntity::Message(m) => vec![
                m.id.to_string(),
                m.date.format("%Y-%m-%d %H:%M:%S").to_string(),
                m.sender.clone(),
                m.text.clone(),
            ],
            CollectedEntity::InviteLink(link) => vec![link.url()],
            CollectedEntity::UserProfile(u) => vec![
                u.id.to_string(),
                u.username.clone().unwrap_or_default(),
                u.full_name(),
                u.phone.clone().unwrap_or_default(),
                u.profile_link().unwrap_or_default(),
            ],
            CollectedEntity::StickerPackInfo(s) => {
                let creator = s.creator.as_ref();
                vec![
                    s.set_id.to_string(),
                    s.short_name.clone(),
                    s.title.clone(),
                    s.count.to_string(),
                    s.creator_id.to_string(),
                    creator
                        .and_then(|c| c.username.clone())
                        .unwrap_or_default(),
                    creator.map(UserProfile::full_name).unwrap_or_default(),
                ]
            }
        }
    }
}

/// Validate a raw item. `chat_title` names channel posts that carry no sender.
pub fn transform(item: RawItem, chat_title: &str) -> Result<CollectedEntity, String> {
    match item {
        RawItem::Member(m) => {
            let user_id = m.id.ok_or("member without id")?;
            Ok(CollectedEntity::Member(Member {
                user_id,
                name: full_name(m.first_name.as_deref(), m.last_name.as_deref()),
                username: non_empty(m.username),
                phone: non_empty(m.phone),
            }))
        }
        RawItem::Message(m) => {
            let id = m.id.ok_or("message without id")?;
            let date = m
                .date
                .ok_or_else(|| format!("message {} without date", id))?;

            let text = match non_empty(m.text) {
                Some(text) => text,
                None => m
                    .media
                    .map(|media| media.placeholder().to_string())
                    .unwrap_or_default(),
            };

            let sender = match m.sender {
                Some(s) => {
                    let name = full_name(s.first_name.as_deref(), s.last_name.as_deref());
                    if !name.is_empty() {
                        name
                    } else if let Some(username) = non_empty(s.username) {
                        username
                    } else {
                        s.id.to_string()
                    }
                }
                None if !chat_title.trim().is_empty() => chat_title.to_string(),
                None => "Channel".to_string(),
            };

            Ok(CollectedEntity::Message(Message {
                id,
                date,
                sender,
                text,
            }))
        }
    }
}

fn full_name(first: Option<&str>, last: Option<&str>) -> String {
    format!("{} {}", first.unwrap_or(""), last.unwrap_or(""))
        .trim()
        .to_string()
}

fn profile_link(username: &str) -> String {
    format!("https://t.me/{}", username)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
