use std::{fs::File, io::BufReader, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bdynfeed::{
    cache::{CacheStore, StateCache},
    config::Config,
    engine::{Registry, Scheduler, Shutdown},
    sources::{bilibili::BiliClient, FeedSource},
    telegram::{TelegramClient, TelegramSubscriber},
};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to configuration file.
    #[arg(long, default_value = ".bdynfeed.yml")]
    config: PathBuf,

    /// Path to cache file.
    #[arg(long, default_value = ".cache.bdynfeed.json")]
    cache: PathBuf,

    /// Populate cache, but not post
    #[arg(long)]
    populate: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bdynfeed=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let Args {
        config,
        cache,
        populate,
    } = Args::parse();

    let cfg: Config = {
        let file = match File::open(&config) {
            Ok(f) => BufReader::new(f),
            Err(e) => {
                error!(path = %config.display(), "failed to open config: {e}");
                return ExitCode::FAILURE;
            }
        };

        match serde_yaml::from_reader(file) {
            Ok(v) => v,
            Err(e) => {
                error!(path = %config.display(), "failed to parse config: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let records = match StateCache::load(&cache) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %cache.display(), "failed to open cache file: {e}");
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(Registry::new());
    for state in records.states() {
        registry.seed(state);
    }
    let store = Arc::new(CacheStore::new(cache, records));

    let source: Arc<dyn FeedSource> = match BiliClient::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("failed to build http client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let telegram = Arc::new(TelegramClient::new(cfg.telegram_token));

    for channel in cfg.channels {
        let key = format!("telegram:{}", channel.chat_id);
        for follow in channel.follows {
            let uid = follow.uid.to_string();
            let subscriber = Arc::new(TelegramSubscriber {
                client: Arc::clone(&telegram),
                chat_id: channel.chat_id.clone(),
                muted: follow.muted_mask(),
                followers: follow.followers,
            });

            // a vanished identity must not keep the others from starting
            if let Err(e) = registry
                .register(&uid, &key, subscriber, source.as_ref())
                .await
            {
                warn!(uid = %uid, key = %key, "subscription failed: {e}");
            }
        }
    }

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        source,
        store,
        cfg.poll.to_poll_config(),
    );

    if populate {
        let updated = scheduler.populate().await;
        info!(updated, "cache populated");
        return ExitCode::SUCCESS;
    }

    let (stop, shutdown) = Shutdown::new();
    let poller = scheduler.spawn(shutdown);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }
    info!("shutting down");
    let _ = stop.send(true);

    if let Err(e) = poller.await {
        error!("poller crashed: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
