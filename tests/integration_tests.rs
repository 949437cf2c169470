//! Integration tests for the tgspyder library
//!
//! These tests verify the public API and module interactions.

mod support;

use std::fs;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use tgspyder::commands::{lookup, lookup_sticker_pack, lookup_user, sticker};
use tgspyder::config::{Config, DEFAULT_PAGE_SIZE, SESSION_NAME};
use tgspyder::engine::{FileResumeStore, RateLimiter};
use tgspyder::error::{Error, FailureKind};
use tgspyder::invites::{extract_invite_links, normalize_invite_link};
use tgspyder::model::{CollectionMode, StickerPackInfo, UserProfile};
use tgspyder::sink::{CsvSink, MemorySink};
use tgspyder::target::{sticker_short_name, TargetRef};

use support::FakeClient;

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_config_new_loads_or_defaults() {
    let config = Config::new();
    assert!(!config.session_name.is_empty());
    assert!(!config.lock_file.is_empty());
    assert!(config.collector.page_size >= 1);
}

#[test]
fn test_config_defaults() {
    assert_eq!(SESSION_NAME, "tgspyder");
    assert_eq!(DEFAULT_PAGE_SIZE, 100);
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn test_fatal_errors_are_separated_from_target_failures() {
    assert!(Error::MissingCredentials("api_id".into()).is_fatal());
    assert!(Error::CheckpointStore("read-only".into()).is_fatal());
    assert!(!Error::TargetNotFound("@x".into()).is_fatal());
    assert_eq!(
        Error::CheckpointStore("read-only".into()).failure_kind(),
        FailureKind::Fatal
    );
}

#[test]
fn test_unwritable_checkpoint_dir_is_reported_up_front() {
    let temp = tempdir().unwrap();
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "file").unwrap();

    let result = FileResumeStore::open(blocker.join("checkpoints"));
    assert!(matches!(result, Err(Error::CheckpointStore(_))));
}

// ============================================================================
// References and links
// ============================================================================

#[test]
fn test_reference_forms() {
    assert_eq!(
        TargetRef::parse("https://t.me/joinchat/AbC-123").unwrap(),
        TargetRef::Invite("AbC-123".into())
    );
    assert_eq!(
        TargetRef::parse("t.me/durov").unwrap(),
        TargetRef::Username("durov".into())
    );
    assert_eq!(
        TargetRef::parse("-1001234567890").unwrap(),
        TargetRef::Id(1234567890)
    );
    assert_eq!(
        sticker_short_name("https://t.me/addstickers/HotCherry").unwrap(),
        "HotCherry"
    );
}

#[test]
fn test_invite_forms_share_one_key() {
    let a = normalize_invite_link("https://t.me/joinchat/ABC").unwrap();
    let b = normalize_invite_link("t.me/joinchat/ABC/").unwrap();
    assert_eq!(a, b);

    let found = extract_invite_links("a https://t.me/joinchat/ABC, b t.me/+ABC.");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].raw, "https://t.me/joinchat/ABC");
    assert_eq!(found[1].raw, "t.me/+ABC");
}

// ============================================================================
// Lookups
// ============================================================================

fn eve() -> UserProfile {
    UserProfile {
        id: 777,
        username: Some("evelyn".into()),
        first_name: Some("Eve".into()),
        last_name: Some("Doe".into()),
        phone: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_user_lookup_writes_one_row() {
    let client = FakeClient::new().with_user("@evelyn", eve());
    let limiter = RateLimiter::new(std::time::Duration::from_millis(100));
    let cancel = CancellationToken::new();

    let profile = lookup_user(&client, &limiter, &cancel, "@evelyn")
        .await
        .unwrap()
        .expect("profile");
    assert_eq!(profile.full_name(), "Eve Doe");
    assert_eq!(profile.profile_link().as_deref(), Some("https://t.me/evelyn"));

    let temp = tempdir().unwrap();
    let sink = CsvSink::new(temp.path());
    lookup::write_profile(&sink, "@evelyn", &profile).unwrap();

    let files = sink.written_files();
    assert_eq!(files.len(), 1);
    let name = files[0].0.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("user_777_"), "{}", name);
    assert!(files[0].0.starts_with(temp.path().join("users")));

    let missing = lookup_user(&client, &limiter, &cancel, "@nobody").await.unwrap();
    assert!(missing.is_none());

    let invite = lookup_user(&client, &limiter, &cancel, "t.me/+AbCdEf").await;
    assert!(matches!(invite, Err(Error::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn test_sticker_pack_lookup_by_link() {
    let pack = StickerPackInfo {
        set_id: (123_456_i64 << 32) | 99,
        short_name: "HotCherry".into(),
        title: "Hot Cherry".into(),
        count: 24,
        creator_id: 123_456,
        creator: Some(eve()),
    };
    let client = FakeClient::new().with_sticker_set(pack.clone());
    let limiter = RateLimiter::new(std::time::Duration::from_millis(100));
    let cancel = CancellationToken::new();

    let found = lookup_sticker_pack(&client, &limiter, &cancel, "https://t.me/addstickers/HotCherry")
        .await
        .unwrap()
        .expect("pack");
    assert_eq!(found, pack);

    let sink = MemorySink::new();
    sticker::write_pack(&sink, "HotCherry", &found).unwrap();
    let rows = sink.rows_for(CollectionMode::Stickers);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][4], "123456");
    assert_eq!(rows[0][5], "evelyn");

    let none = lookup_sticker_pack(&client, &limiter, &cancel, "Unknown")
        .await
        .unwrap();
    assert!(none.is_none());
}
