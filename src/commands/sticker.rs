//! Sticker pack lookup (`--sticker-pack`).

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::ApiClient;
use crate::config::Config;
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ApiError, Error, Result};
use crate::metrics;
use crate::model::{CollectedEntity, CollectionMode, StickerPackInfo};
use crate::sink::{CsvSink, OutputSink};
use crate::target::{sticker_short_name, Target, TargetKind};

use super::open_session;

/// Look a pack up by `t.me/addstickers/<name>` URL or bare short name.
pub async fn lookup_sticker_pack(
    client: &dyn ApiClient,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
    raw: &str,
) -> Result<Option<StickerPackInfo>> {
    let short_name = sticker_short_name(raw)?;
    limiter.acquire(cancel).await?;

    let mode = CollectionMode::Stickers.label();
    match client.lookup_sticker_set(&short_name).await {
        Ok(info) => {
            metrics::record_api_call(mode, "ok");
            Ok(info)
        }
        Err(err) => {
            if let ApiError::FloodWait(wait) = &err {
                metrics::record_flood_wait(*wait);
                limiter.note_cooldown(*wait);
            }
            metrics::record_api_call(mode, "error");
            Err(Error::from_api(raw, err))
        }
    }
}

pub fn write_pack(sink: &dyn OutputSink, raw: &str, pack: &StickerPackInfo) -> Result<()> {
    let target = Target::new(raw, pack.set_id, TargetKind::StickerPack, pack.short_name.clone());
    let entity = CollectedEntity::StickerPackInfo(pack.clone());
    sink.write_row(entity.mode(), &target, entity.to_row())?;
    sink.flush()
}

pub fn print_pack(pack: &StickerPackInfo) {
    println!("Sticker pack: {} ({})", pack.title, pack.short_name);
    println!("Set ID:       {}", pack.set_id);
    println!("Stickers:     {}", pack.count);
    println!("Creator ID:   {}", pack.creator_id);
    match &pack.creator {
        Some(creator) => {
            let name = creator.full_name();
            if !name.is_empty() {
                println!("Creator:      {}", name);
            }
            if let Some(link) = creator.profile_link() {
                println!("Profile link: {}", link);
            }
        }
        None => println!("Creator:      profile not resolvable"),
    }
}

pub async fn run(
    config: &Config,
    raw: &str,
    proxy: Option<&str>,
    cancel: CancellationToken,
) -> Result<()> {
    let session = open_session(config, proxy, &cancel).await?;
    let pack = lookup_sticker_pack(session.client.as_ref(), &session.limiter, &cancel, raw)
        .await?
        .ok_or_else(|| Error::TargetNotFound(format!("sticker pack {}", raw)))?;

    print_pack(&pack);
    let sink = CsvSink::new(&config.output_dir);
    write_pack(&sink, raw, &pack)?;
    for (path, _) in sink.written_files() {
        info!(path = %path.display(), "sticker pack saved");
    }
    Ok(())
}
