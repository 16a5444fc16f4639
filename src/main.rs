use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use transock::config::DEFAULT_CONFIG_PATH;
use transock::{Config, ProxyServer, ProxyState};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
  /// Configuration file
  #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
  config: PathBuf,

  /// Log filter used when RUST_LOG is unset
  #[arg(long, default_value = "info")]
  log_level: String,
}

fn main() -> ExitCode {
  let args = Args::parse();
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
    )
    .with_target(false)
    .compact()
    .init();

  let config = match Config::load(&args.config) {
    Ok(config) => config,
    Err(e) => {
      tracing::error!("error loading {}: {}", args.config.display(), e);
      return ExitCode::FAILURE;
    }
  };
  let runtime = match tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
  {
    Ok(runtime) => runtime,
    Err(e) => {
      tracing::error!("could not start runtime: {}", e);
      return ExitCode::FAILURE;
    }
  };
  match runtime.block_on(run(config)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(config: Config) -> transock::Result<()> {
  let server = ProxyServer::new(&config)?;
  let state = server.state().clone();
  tokio::spawn(watch_signals(state));
  server.run().await
}

async fn watch_signals(state: std::sync::Arc<ProxyState>) {
  terminated().await;
  tracing::info!("received shutdown signal, closing listeners");
  state.shutdown();
}

#[cfg(unix)]
async fn terminated() {
  use tokio::signal::unix::{signal, SignalKind};
  match signal(SignalKind::terminate()) {
    Ok(mut term) => {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
      }
    }
    Err(e) => {
      tracing::warn!("cannot listen for SIGTERM: {}", e);
      let _ = tokio::signal::ctrl_c().await;
    }
  }
}

#[cfg(not(unix))]
async fn terminated() {
  let _ = tokio::signal::ctrl_c().await;
}
