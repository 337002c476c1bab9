mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use taskdeck::api::CachedApiClient;
use taskdeck::cache::{EntityCache, SqliteSnapshot};
use taskdeck::config::Config;
use taskdeck::error::ClientError;
use taskdeck::logging;
use taskdeck::notify::{ConsoleNotifier, Notifier, TracingNotifier};

use commands::{Command, Context};

#[derive(Parser, Debug)]
#[command(name = "taskdeck")]
#[command(about = "Cached command-line client for a project/task board")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskdeck/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Neither read nor write the on-disk cache
  #[arg(long, global = true)]
  no_cache: bool,

  /// Send notifications to the log file instead of stderr
  #[arg(short, long, global = true)]
  quiet: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let guard = logging::init(&config.log)?;

  let cache = EntityCache::new().with_stale_time(config.query.stale_time());
  let snapshot = if config.cache.persist && !args.no_cache {
    open_snapshot(&config, &cache)
  } else {
    None
  };

  let notifier: Arc<dyn Notifier> = if args.quiet {
    Arc::new(TracingNotifier)
  } else {
    Arc::new(ConsoleNotifier)
  };
  let client = CachedApiClient::new(&config, cache.clone(), notifier)?;
  let ctx = Context { client, snapshot };

  let outcome = commands::run(args.command, &ctx).await;

  if let Some(snapshot) = &ctx.snapshot {
    match snapshot.save(&cache) {
      Ok(saved) => info!(saved, "cache snapshot written"),
      Err(e) => warn!(error = %e, "failed to write cache snapshot"),
    }
  }

  match outcome {
    // Failed writes were already reported through the notifier
    Err(report) if matches!(report.downcast_ref::<ClientError>(), Some(ClientError::Mutation(_))) => {
      drop(guard);
      std::process::exit(1)
    }
    other => other,
  }
}

/// Open the snapshot and warm the cache from it. A broken snapshot only
/// costs the warm start, so failures are logged and skipped.
fn open_snapshot(config: &Config, cache: &EntityCache) -> Option<SqliteSnapshot> {
  let opened = match &config.cache.path {
    Some(path) => SqliteSnapshot::open(path),
    None => SqliteSnapshot::open_default(),
  };

  match opened {
    Ok(snapshot) => {
      match snapshot.load(cache) {
        Ok(loaded) => info!(loaded, "cache snapshot loaded"),
        Err(e) => warn!(error = %e, "failed to load cache snapshot"),
      }
      Some(snapshot)
    }
    Err(e) => {
      warn!(error = %e, "cache snapshot unavailable");
      None
    }
  }
}
