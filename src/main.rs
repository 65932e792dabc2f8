//! Process entry point: parses flags into a `ServerConfig`, loads hooks,
//! starts hot-reload watching and the HTTP listener, and routes shutdown
//! and reload signals (spec §5 / §6).

use clap::Parser;
use hookd::cli::Cli;
use hookd::config::ServerConfig;
use hookd::dispatcher::{Dispatcher, DispatcherConfig};
use hookd::http::metrics::Metrics;
use hookd::http::middleware::RateLimiterMiddleware;
use hookd::http::{self, AppState};
use hookd::loader::{self, DocumentMode};
use hookd::logging;
use hookd::registry::Registry;
use hookd::watcher::{self, Watcher};
use log::LevelFilter;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.warn_unimplemented();

    let level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    logging::init_with_target(level, cli.logfile.as_deref());

    let validate_only = cli.validate_config;
    let config = cli.into_server_config();

    if config.hook_files.is_empty() && !config.nopanic {
        log::error!("no -hooks given; nothing to serve");
        std::process::exit(1);
    }

    let registry = Arc::new(Registry::new());
    let mut load_failures = 0usize;
    for path in &config.hook_files {
        match loader::load_file(path, config.document_mode).await {
            Ok(hooks) => {
                if let Err(e) = registry.replace_file(path, hooks) {
                    log::error!("{path:?}: {e}");
                    load_failures += 1;
                }
            }
            Err(e) => {
                log::error!("failed to load {path:?}: {e}");
                load_failures += 1;
            }
        }
    }

    if validate_only {
        if load_failures > 0 {
            log::error!("validation failed: {load_failures} file(s) did not load cleanly");
            std::process::exit(1);
        }
        log::info!("validation ok: {} hook(s) loaded from {} file(s)", registry.len(), config.hook_files.len());
        std::process::exit(0);
    }

    if registry.is_empty() {
        if config.nopanic {
            log::warn!("no hooks were loaded; continuing to serve because -nopanic is set");
        } else {
            log::error!("no hooks were loaded");
            std::process::exit(1);
        }
    } else {
        log::info!("loaded {} hook(s) from {} file(s)", registry.len(), config.hook_files.len());
    }

    let mut watchers: Vec<Watcher> = Vec::new();
    if config.hot_reload {
        watchers = start_watchers(&config, &registry).await;
    }

    let metrics = Arc::new(Metrics::new());
    let dispatcher_config = DispatcherConfig {
        command_policy: config.command_policy.clone(),
        hook_concurrency: config.hook_concurrency,
        acquire_timeout: config.hook_acquire_timeout,
        execution_timeout: config.hook_execution_timeout,
        default_http_methods: config.default_http_methods.clone(),
        max_multipart_memory: config.max_multipart_memory,
    };
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), dispatcher_config).with_metrics(metrics.clone()));
    let rate_limiter = Arc::new(RateLimiterMiddleware::new(&config.rate_limit));

    let listener = match tokio::net::TcpListener::bind(config.socket_addr()).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {}: {e}", config.socket_addr());
            std::process::exit(1);
        }
    };
    log::info!("listening on {}", config.socket_addr());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState { config: config.clone(), registry: registry.clone(), dispatcher, metrics, rate_limiter });

    let reload_dirs = hook_directories(&config.hook_files);
    let document_mode = config.document_mode;
    let signal_registry = registry.clone();
    tokio::spawn(async move {
        route_signals(shutdown_tx, signal_registry, reload_dirs, document_mode).await;
    });

    http::serve(listener, state, shutdown_rx).await;
    drop(watchers);
    log::info!("shutdown complete");
}

fn hook_directories(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut dirs = Vec::new();
    for f in files {
        if let Some(dir) = f.parent() {
            if seen.insert(dir.to_path_buf()) {
                dirs.push(dir.to_path_buf());
            }
        }
    }
    dirs
}

async fn start_watchers(config: &ServerConfig, registry: &Arc<Registry>) -> Vec<Watcher> {
    let mut watchers = Vec::new();
    for dir in hook_directories(&config.hook_files) {
        match watcher::watch_directory(dir.clone(), config.document_mode, registry.clone()).await {
            Ok(w) => watchers.push(w),
            Err(e) => log::error!("failed to watch {} for hot-reload: {e}", dir.display()),
        }
    }
    watchers
}

/// Single reader of process signals (spec §4.C9/§5): SIGINT/SIGTERM
/// trigger graceful shutdown, SIGHUP/SIGUSR1 trigger a full reload of
/// every hooks directory.
async fn route_signals(shutdown_tx: watch::Sender<bool>, registry: Arc<Registry>, reload_dirs: Vec<PathBuf>, mode: DocumentMode) {
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGINT handler: {e}");
            return;
        }
    };
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGHUP handler: {e}");
            return;
        }
    };
    let mut sigusr1 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGUSR1 handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                log::info!("received SIGINT, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = sighup.recv() => {
                log::info!("received SIGHUP, reloading all hooks");
                for dir in &reload_dirs {
                    watcher::reload_all(dir, mode, &registry).await;
                }
            }
            _ = sigusr1.recv() => {
                log::info!("received SIGUSR1, reloading all hooks");
                for dir in &reload_dirs {
                    watcher::reload_all(dir, mode, &registry).await;
                }
            }
        }
    }
}
