//! grammers-backed [`ApiClient`].
//!
//! Raw TL calls are used where the collector needs explicit offsets
//! (participants, history) so a page can be re-requested from a checkpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use grammers_client::types::peer::Peer;
use grammers_client::InvocationError;
use grammers_tl_types as tl;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{ApiClient, PageKind};
use crate::engine::pager::Page;
use crate::engine::rate_limiter::RateLimiter;
use crate::error::ApiError;
use crate::model::{MediaKind, RawItem, RawMember, RawMessage, RawSender, StickerPackInfo, UserProfile};
use crate::session::TelegramClient;
use crate::target::{Target, TargetKind, TargetRef};

/// Extra participant searches that get past the server's cap on one listing.
const SEARCH_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Server caps per request.
const PARTICIPANTS_PAGE_MAX: usize = 200;
const HISTORY_PAGE_MAX: usize = 100;

pub struct GrammersClient {
    client: TelegramClient,
    peers: Mutex<HashMap<i64, tl::enums::InputPeer>>,
    // Follow-up calls inside one fetch go through the same limiter.
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    aggressive_members: bool,
}

impl GrammersClient {
    pub fn new(
        client: TelegramClient,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
        aggressive_members: bool,
    ) -> Self {
        Self {
            client,
            peers: Mutex::new(HashMap::new()),
            limiter,
            cancel,
            aggressive_members,
        }
    }

    fn remember(&self, id: i64, input: tl::enums::InputPeer) {
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, input);
    }

    fn input_peer(&self, target: &Target) -> Result<tl::enums::InputPeer, ApiError> {
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&target.id())
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{} was not resolved", target.reference())))
    }

    /// Wait for the limiter before a follow-up call. `false` when cancelled.
    async fn pace(&self) -> bool {
        self.limiter.acquire(&self.cancel).await.is_ok()
    }

    fn target_from_peer(&self, reference: &TargetRef, peer: &Peer) -> Result<Target, ApiError> {
        let title = peer.name().unwrap_or_default().to_string();
        let (id, kind, input) = match peer {
            Peer::User(user) => {
                let (user_id, access_hash) = match &user.raw {
                    tl::enums::User::User(u) => (u.id, u.access_hash.unwrap_or(0)),
                    tl::enums::User::Empty(u) => (u.id, 0),
                };
                let input = tl::enums::InputPeer::User(tl::types::InputPeerUser {
                    user_id,
                    access_hash,
                });
                (user_id, TargetKind::User, input)
            }
            Peer::Channel(channel) => {
                let kind = if channel.raw.megagroup {
                    TargetKind::Group
                } else {
                    TargetKind::Channel
                };
                let input = tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                    channel_id: channel.raw.id,
                    access_hash: channel.raw.access_hash.unwrap_or(0),
                });
                (channel.raw.id, kind, input)
            }
            Peer::Group(group) => return self.target_from_chat(reference, &group.raw),
        };
        self.remember(id, input);
        Ok(Target::new(reference.to_string(), id, kind, title))
    }

    fn target_from_chat(
        &self,
        reference: &TargetRef,
        chat: &tl::enums::Chat,
    ) -> Result<Target, ApiError> {
        let (id, kind, title, input) = match chat {
            tl::enums::Chat::Chat(c) => (
                c.id,
                TargetKind::Group,
                c.title.clone(),
                tl::enums::InputPeer::Chat(tl::types::InputPeerChat { chat_id: c.id }),
            ),
            tl::enums::Chat::Channel(c) => (
                c.id,
                if c.megagroup {
                    TargetKind::Group
                } else {
                    TargetKind::Channel
                },
                c.title.clone(),
                tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                    channel_id: c.id,
                    access_hash: c.access_hash.unwrap_or(0),
                }),
            ),
            tl::enums::Chat::Forbidden(c) => {
                return Err(ApiError::NotVisible(format!("chat '{}' is forbidden", c.title)))
            }
            tl::enums::Chat::ChannelForbidden(c) => {
                return Err(ApiError::NotVisible(format!(
                    "channel '{}' is forbidden",
                    c.title
                )))
            }
            tl::enums::Chat::Empty(c) => {
                return Err(ApiError::NotFound(format!("chat {} is empty", c.id)))
            }
        };
        self.remember(id, input);
        Ok(Target::new(reference.to_string(), id, kind, title))
    }

    /// Look a numeric id up among the account's dialogs.
    async fn find_dialog(&self, id: i64) -> Result<Option<Peer>, ApiError> {
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await? {
            let peer_id = match &dialog.peer {
                Peer::User(user) => user.raw.id(),
                Peer::Channel(channel) => channel.raw.id,
                Peer::Group(group) => match &group.raw {
                    tl::enums::Chat::Empty(c) => c.id,
                    tl::enums::Chat::Chat(c) => c.id,
                    tl::enums::Chat::Forbidden(c) => c.id,
                    tl::enums::Chat::Channel(c) => c.id,
                    tl::enums::Chat::ChannelForbidden(c) => c.id,
                },
            };
            if peer_id == id {
                return Ok(Some(dialog.peer.clone()));
            }
        }
        Ok(None)
    }

    /// Join a private invite, or look the chat up when already a member.
    async fn join_invite(&self, hash: &str) -> Result<tl::enums::Chat, ApiError> {
        let request = tl::functions::messages::ImportChatInvite {
            hash: hash.to_string(),
        };
        match self.client.invoke(&request).await {
            Ok(updates) => {
                let chats = match updates {
                    tl::enums::Updates::Updates(u) => u.chats,
                    tl::enums::Updates::Combined(u) => u.chats,
                    _ => Vec::new(),
                };
                if let Some(chat) = chats.into_iter().next() {
                    info!(invite = hash, "joined chat from invite");
                    return Ok(chat);
                }
            }
            Err(InvocationError::Rpc(rpc)) if rpc.name == "USER_ALREADY_PARTICIPANT" => {
                debug!(invite = hash, "already a participant");
            }
            Err(err) => return Err(err.into()),
        }

        if !self.pace().await {
            return Err(ApiError::Network("cancelled while checking invite".to_string()));
        }
        let check = tl::functions::messages::CheckChatInvite {
            hash: hash.to_string(),
        };
        match self.client.invoke(&check).await? {
            tl::enums::ChatInvite::Already(already) => Ok(already.chat),
            tl::enums::ChatInvite::Peek(peek) => Ok(peek.chat),
            _ => Err(ApiError::NotVisible(
                "invite does not grant access to the chat".to_string(),
            )),
        }
    }

    async fn fetch_channel_members(
        &self,
        channel: tl::enums::InputChannel,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawItem>, ApiError> {
        let queries = if self.aggressive_members {
            1 + SEARCH_ALPHABET.len()
        } else {
            1
        };
        let (query, offset) = parse_member_cursor(cursor)?;
        let limit = limit.min(PARTICIPANTS_PAGE_MAX);

        let filter: tl::enums::ChannelParticipantsFilter = if query == 0 {
            tl::types::ChannelParticipantsRecent {}.into()
        } else {
            let letter = SEARCH_ALPHABET[(query - 1) % SEARCH_ALPHABET.len()] as char;
            tl::types::ChannelParticipantsSearch {
                q: letter.to_string(),
            }
            .into()
        };
        let request = tl::functions::channels::GetParticipants {
            channel,
            filter,
            offset: offset as i32,
            limit: limit as i32,
            hash: 0,
        };
        let result: tl::types::channels::ChannelParticipants = self
            .client
            .invoke(&request)
            .await?
            .try_into()
            .map_err(|_| ApiError::Malformed("participants listing not modified".to_string()))?;

        let fetched = result.participants.len();
        let next = next_member_cursor(query, offset, fetched, limit, queries);
        match next {
            // A search letter with no matches moves on to the next letter.
            Some(next) if fetched == 0 => Ok(Page::skip(next)),
            next => {
                let items = result.users.iter().filter_map(raw_member).collect();
                Ok(Page::new(items, next))
            }
        }
    }

    async fn fetch_chat_members(&self, chat_id: i64) -> Result<Page<RawItem>, ApiError> {
        let full: tl::types::messages::ChatFull = self
            .client
            .invoke(&tl::functions::messages::GetFullChat { chat_id })
            .await?
            .try_into()
            .map_err(|_| ApiError::Malformed("unexpected full chat shape".to_string()))?;
        Ok(Page::last(full.users.iter().filter_map(raw_member).collect()))
    }

    async fn fetch_history(
        &self,
        peer: tl::enums::InputPeer,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawItem>, ApiError> {
        let after = match cursor {
            None => 0,
            Some(raw) => raw
                .parse::<i32>()
                .map_err(|_| ApiError::Malformed(format!("bad history cursor '{}'", raw)))?,
        };
        let (offset_id, add_offset, limit) = history_window(after, limit);
        let request = tl::functions::messages::GetHistory {
            peer,
            offset_id,
            offset_date: 0,
            add_offset,
            limit,
            max_id: 0,
            min_id: after,
            hash: 0,
        };

        let (messages, users, chats) = match self.client.invoke(&request).await? {
            tl::enums::messages::Messages::Messages(m) => (m.messages, m.users, m.chats),
            tl::enums::messages::Messages::Slice(m) => (m.messages, m.users, m.chats),
            tl::enums::messages::Messages::ChannelMessages(m) => (m.messages, m.users, m.chats),
            tl::enums::messages::Messages::NotModified(_) => (Vec::new(), Vec::new(), Vec::new()),
        };

        let users: HashMap<i64, &tl::types::User> = users
            .iter()
            .filter_map(|u| match u {
                tl::enums::User::User(u) => Some((u.id, u)),
                tl::enums::User::Empty(_) => None,
            })
            .collect();
        let chats: HashMap<i64, String> = chats.iter().map(chat_id_title).collect();

        let mut page: Vec<(i32, Option<RawItem>)> = messages
            .into_iter()
            .filter_map(|m| raw_message(m, &users, &chats))
            .filter(|(id, _)| *id > after)
            .collect();
        page.sort_by_key(|(id, _)| *id);

        let next = page.last().map(|(id, _)| id.to_string());
        let items = page.into_iter().filter_map(|(_, item)| item).collect();
        Ok(Page::new(items, next))
    }
}

#[async_trait]
impl ApiClient for GrammersClient {
    async fn resolve_target(&self, reference: &TargetRef) -> Result<Target, ApiError> {
        match reference {
            TargetRef::Username(name) => {
                let peer = self
                    .client
                    .resolve_username(name)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("@{}", name)))?;
                self.target_from_peer(reference, &peer)
            }
            TargetRef::Id(id) => {
                let peer = self
                    .find_dialog(*id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("{} is not among this account's dialogs", id)))?;
                self.target_from_peer(reference, &peer)
            }
            TargetRef::Invite(hash) => {
                let chat = self.join_invite(hash).await?;
                self.target_from_chat(reference, &chat)
            }
        }
    }

    async fn fetch_page(
        &self,
        target: &Target,
        kind: PageKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawItem>, ApiError> {
        let input = self.input_peer(target)?;
        match kind {
            PageKind::History => self.fetch_history(input, cursor, limit).await,
            PageKind::Members => match input {
                tl::enums::InputPeer::Channel(c) => {
                    let channel: tl::enums::InputChannel = tl::types::InputChannel {
                        channel_id: c.channel_id,
                        access_hash: c.access_hash,
                    }
                    .into();
                    self.fetch_channel_members(channel, cursor, limit).await
                }
                tl::enums::InputPeer::Chat(c) => self.fetch_chat_members(c.chat_id).await,
                _ => Err(ApiError::NotVisible(
                    "members are only listed for groups and channels".to_string(),
                )),
            },
        }
    }

    async fn lookup_user(&self, reference: &TargetRef) -> Result<Option<UserProfile>, ApiError> {
        let peer = match reference {
            TargetRef::Username(name) => self.client.resolve_username(name).await?,
            TargetRef::Id(id) => self.find_dialog(*id).await?,
            TargetRef::Invite(_) => return Ok(None),
        };
        Ok(match peer {
            Some(Peer::User(user)) => user_profile(&user.raw),
            _ => None,
        })
    }

    async fn lookup_sticker_set(
        &self,
        short_name: &str,
    ) -> Result<Option<StickerPackInfo>, ApiError> {
        let request = tl::functions::messages::GetStickerSet {
            stickerset: tl::types::InputStickerSetShortName {
                short_name: short_name.to_string(),
            }
            .into(),
            hash: 0,
        };
        let result = match self.client.invoke(&request).await {
            Ok(result) => result,
            Err(InvocationError::Rpc(rpc)) if rpc.name == "STICKERSET_INVALID" => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let full: tl::types::messages::StickerSet = result
            .try_into()
            .map_err(|_| ApiError::Malformed("sticker set not modified".to_string()))?;
        let set: tl::types::StickerSet = full
            .set
            .try_into()
            .map_err(|_| ApiError::Malformed("unexpected sticker set shape".to_string()))?;

        // Set ids carry the creator's user id in their upper 32 bits.
        let creator_id = set.id >> 32;

        let creator = if self.pace().await {
            let request = tl::functions::users::GetUsers {
                id: vec![tl::types::InputUser {
                    user_id: creator_id,
                    access_hash: 0,
                }
                .into()],
            };
            match self.client.invoke(&request).await {
                Ok(users) => users.iter().find_map(user_profile),
                Err(err) => {
                    debug!(creator_id, error = %err, "creator profile not resolvable");
                    None
                }
            }
        } else {
            None
        };

        Ok(Some(StickerPackInfo {
            set_id: set.id,
            short_name: set.short_name,
            title: set.title,
            count: set.count,
            creator_id,
            creator,
        }))
    }
}

fn parse_member_cursor(cursor: Option<&str>) -> Result<(usize, usize), ApiError> {
    let Some(raw) = cursor else {
        return Ok((0, 0));
    };
    raw.split_once(':')
        .and_then(|(q, o)| Some((q.parse().ok()?, o.parse().ok()?)))
        .ok_or_else(|| ApiError::Malformed(format!("bad members cursor '{}'", raw)))
}

fn format_member_cursor(query: usize, offset: usize) -> String {
    format!("{}:{}", query, offset)
}

/// A full page continues the same query; a short one moves to the next
/// query, if any.
fn next_member_cursor(
    query: usize,
    offset: usize,
    fetched: usize,
    limit: usize,
    queries: usize,
) -> Option<String> {
    if fetched >= limit {
        Some(format_member_cursor(query, offset + fetched))
    } else if query + 1 < queries {
        Some(format_member_cursor(query + 1, 0))
    } else {
        None
    }
}

/// `(offset_id, add_offset, limit)` for the oldest messages newer than
/// `after`. The window must fit in one server page or the messages right
/// after `after` fall outside it.
fn history_window(after: i32, limit: usize) -> (i32, i32, i32) {
    let limit = limit.clamp(1, HISTORY_PAGE_MAX) as i32;
    (after + 1, -limit, limit)
}

fn raw_member(user: &tl::enums::User) -> Option<RawItem> {
    match user {
        tl::enums::User::User(u) => Some(RawItem::Member(RawMember {
            id: Some(u.id),
            username: u.username.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            phone: u.phone.clone(),
        })),
        tl::enums::User::Empty(u) => Some(RawItem::Member(RawMember {
            id: Some(u.id),
            ..RawMember::default()
        })),
    }
}

fn user_profile(user: &tl::enums::User) -> Option<UserProfile> {
    match user {
        tl::enums::User::User(u) => Some(UserProfile {
            id: u.id,
            username: u.username.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            phone: u.phone.clone(),
        }),
        tl::enums::User::Empty(_) => None,
    }
}

fn chat_id_title(chat: &tl::enums::Chat) -> (i64, String) {
    match chat {
        tl::enums::Chat::Empty(c) => (c.id, String::new()),
        tl::enums::Chat::Chat(c) => (c.id, c.title.clone()),
        tl::enums::Chat::Forbidden(c) => (c.id, c.title.clone()),
        tl::enums::Chat::Channel(c) => (c.id, c.title.clone()),
        tl::enums::Chat::ChannelForbidden(c) => (c.id, c.title.clone()),
    }
}

fn media_kind(media: &tl::enums::MessageMedia) -> MediaKind {
    match media {
        tl::enums::MessageMedia::Photo(_) => MediaKind::Photo,
        tl::enums::MessageMedia::Document(d) => match &d.document {
            Some(tl::enums::Document::Document(doc))
                if doc
                    .attributes
                    .iter()
                    .any(|a| matches!(a, tl::enums::DocumentAttribute::Sticker(_))) =>
            {
                MediaKind::Sticker
            }
            _ => MediaKind::Document,
        },
        _ => MediaKind::Other,
    }
}

fn raw_sender(
    from: &tl::enums::Peer,
    users: &HashMap<i64, &tl::types::User>,
    chats: &HashMap<i64, String>,
) -> RawSender {
    match from {
        tl::enums::Peer::User(p) => match users.get(&p.user_id) {
            Some(u) => RawSender {
                id: u.id,
                username: u.username.clone(),
                first_name: u.first_name.clone(),
                last_name: u.last_name.clone(),
            },
            None => RawSender {
                id: p.user_id,
                ..RawSender::default()
            },
        },
        tl::enums::Peer::Chat(p) => RawSender {
            id: p.chat_id,
            first_name: chats.get(&p.chat_id).cloned(),
            ..RawSender::default()
        },
        tl::enums::Peer::Channel(p) => RawSender {
            id: p.channel_id,
            first_name: chats.get(&p.channel_id).cloned(),
            ..RawSender::default()
        },
    }
}

/// Message id plus the raw item; empty placeholders keep their id so the
/// cursor moves past them but produce no item.
fn raw_message(
    message: tl::enums::Message,
    users: &HashMap<i64, &tl::types::User>,
    chats: &HashMap<i64, String>,
) -> Option<(i32, Option<RawItem>)> {
    match message {
        tl::enums::Message::Message(m) => {
            let item = RawMessage {
                id: Some(i64::from(m.id)),
                date: DateTime::from_timestamp(i64::from(m.date), 0),
                text: Some(m.message),
                media: m.media.as_ref().map(media_kind),
                sender: m.from_id.as_ref().map(|p| raw_sender(p, users, chats)),
            };
            Some((m.id, Some(RawItem::Message(item))))
        }
        tl::enums::Message::Service(m) => {
            let item = RawMessage {
                id: Some(i64::from(m.id)),
                date: DateTime::from_timestamp(i64::from(m.date), 0),
                text: None,
                media: None,
                sender: m.from_id.as_ref().map(|p| raw_sender(p, users, chats)),
            };
            Some((m.id, Some(RawItem::Message(item))))
        }
        tl::enums::Message::Empty(m) => Some((m.id, None)),
    }
}
