//! tgspyder CLI - main entry point

use clap::Parser;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use tgspyder::commands::{
    self, combine_exit_codes, error_exit_code, Action, CollectRequest, Invocation,
};
use tgspyder::{metrics, Config, Error};

#[derive(Parser)]
#[command(name = "tgspyder")]
#[command(about = "Collect members, messages and invite links from Telegram chats", long_about = None)]
#[command(version)]
struct Cli {
    /// Targets: @username, t.me links, private invite links or numeric ids
    targets: Vec<String>,

    /// Collect the member list of each target
    #[arg(short, long)]
    members: bool,

    /// Collect message history of each target
    #[arg(short, long)]
    chats: bool,

    /// Collect invite links posted in each target's history
    #[arg(long)]
    crawl_invites: bool,

    /// Look up a single user by @username or id
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Look up a sticker pack by t.me/addstickers link or short name
    #[arg(long, value_name = "PACK")]
    sticker_pack: Option<String>,

    /// Proxy for this run only (socks5://host:port or type:host:port[:user:pass])
    #[arg(long, env = "TGSPYDER_PROXY")]
    proxy: Option<String>,

    /// Validate and store a proxy for later runs
    #[arg(long, value_name = "PROXY", conflicts_with = "remove_proxy")]
    set_proxy: Option<String>,

    /// Remove the stored proxy
    #[arg(long)]
    remove_proxy: bool,

    /// Ignore saved progress and start over
    #[arg(long)]
    fresh: bool,

    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let directive = if cli.verbose {
        "tgspyder=debug"
    } else {
        "tgspyder=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    if let Some(addr) = cli.metrics_addr.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(socket) => metrics::spawn_metrics_server(socket),
            Err(err) => warn!(%addr, "Invalid metrics address: {}", err),
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("stop requested; progress up to the last flushed batch is kept");
                cancel.cancel();
            }
        }
    });

    let code = match execute(cli, cancel).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "tgspyder stopped");
            eprintln!("Error: {}", err);
            error_exit_code(&err)
        }
    };
    std::process::exit(code);
}

/// Run each requested step in order. A step that fails for its own
/// reason is reported and the rest still run; fatal errors and a stop
/// request end the invocation.
async fn execute(cli: Cli, cancel: CancellationToken) -> tgspyder::Result<i32> {
    let proxy = cli.proxy;
    let actions = Invocation {
        set_proxy: cli.set_proxy,
        remove_proxy: cli.remove_proxy,
        user: cli.user,
        sticker_pack: cli.sticker_pack,
        collect: CollectRequest {
            targets: cli.targets,
            members: cli.members,
            chats: cli.chats,
            crawl_invites: cli.crawl_invites,
            fresh: cli.fresh,
        },
    }
    .actions()?;

    let config = Config::new();
    let proxy = proxy.as_deref();
    let mut code = 0;
    for action in actions {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let result = match action {
            Action::SetProxy(raw) => commands::proxy::run_set(&raw).map(|_| 0),
            Action::RemoveProxy => commands::proxy::run_remove().map(|_| 0),
            Action::LookupUser(raw) => commands::lookup::run(&config, &raw, proxy, cancel.clone())
                .await
                .map(|_| 0),
            Action::StickerPack(raw) => {
                commands::sticker::run(&config, &raw, proxy, cancel.clone())
                    .await
                    .map(|_| 0)
            }
            Action::Collect(request) => {
                commands::collect::run(&config, &request, proxy, cancel.clone()).await
            }
        };
        match result {
            Ok(step) => code = combine_exit_codes(code, step),
            Err(err) if err.is_fatal() || matches!(err, Error::Cancelled) => return Err(err),
            Err(err) => {
                error!(error = %err, "step failed");
                eprintln!("Error: {}", err);
                code = combine_exit_codes(code, error_exit_code(&err));
            }
        }
    }
    Ok(code)
}
