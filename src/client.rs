//! Boundary to the remote platform.
//!
//! The engine only talks to [`ApiClient`]; `telegram::GrammersClient` is the
//! production implementation and tests use scripted fakes.

use async_trait::async_trait;

use crate::engine::pager::Page;
use crate::error::ApiError;
use crate::model::{RawItem, StickerPackInfo, UserProfile};
use crate::target::{Target, TargetRef};

/// Which paginated listing to read from a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Members,
    History,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Resolve a parsed reference, joining private invites when needed.
    async fn resolve_target(&self, reference: &TargetRef) -> Result<Target, ApiError>;

    /// One page of `kind` starting at `cursor` (`None` = from the beginning).
    ///
    /// The returned `next_cursor` is opaque to the caller; `None` means there
    /// is nothing after this page.
    async fn fetch_page(
        &self,
        target: &Target,
        kind: PageKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawItem>, ApiError>;

    /// `Ok(None)` when the reference resolves to something that is not a user.
    async fn lookup_user(&self, reference: &TargetRef) -> Result<Option<UserProfile>, ApiError>;

    /// `Ok(None)` when no set has this short name.
    async fn lookup_sticker_set(&self, short_name: &str)
        -> Result<Option<StickerPackInfo>, ApiError>;
}
