use std::time::Duration;

use clap::Parser;
use error::AppError;
use ferry_engine::{DownloadManager, DownloaderConfig, ManagerConfig, ProxyConfig};
use tracing::{Level, debug, error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod commands;
mod error;
mod utils;

use cli::{CliArgs, Command, HttpArgs, StorageArgs};
use utils::{format_bytes, parse_headers, parse_size};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    init_logging(&args)?;
    info!(version = env!("CARGO_PKG_VERSION"), "ferry starting");

    let jobs = match &args.command {
        Command::Ensure { jobs, .. } => Some(*jobs),
        _ => None,
    };
    let config = manager_config(&args.storage, &args.http, jobs)?;
    let manager = DownloadManager::builder().with_config(config).build().await?;

    match &args.command {
        Command::Ensure {
            urls,
            on_quota,
            no_progress,
            ..
        } => commands::ensure(&manager, urls, *on_quota, !no_progress).await,
        Command::Verify { urls } => commands::verify(&manager, urls).await,
        Command::Evict { urls } => commands::evict(&manager, urls).await,
        Command::Repair { urls } => commands::repair(&manager, urls).await,
        Command::Status => commands::status(&manager).await,
        Command::Clear => commands::clear(&manager).await,
    }
}

fn init_logging(args: &CliArgs) -> Result<(), AppError> {
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true);

    let result = match &args.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                AppError::InvalidInput(format!("log file {} has no file name", path.display()))
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let writer = MakeWriterExt::and(std::io::stderr, appender);
            tracing::subscriber::set_global_default(builder.with_writer(writer).finish())
        }
        None => {
            tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())
        }
    };
    result.map_err(|e| AppError::Initialization(e.to_string()))
}

fn manager_config(
    storage: &StorageArgs,
    http: &HttpArgs,
    jobs: Option<usize>,
) -> Result<ManagerConfig, AppError> {
    let mut downloader = DownloaderConfig::builder()
        .with_connect_timeout(Duration::from_secs(http.connect_timeout))
        .with_read_timeout(Duration::from_secs(http.read_timeout))
        .with_extra_headers(parse_headers(&http.headers)?);
    if http.timeout > 0 {
        downloader = downloader.with_timeout(Duration::from_secs(http.timeout));
    }

    downloader = if http.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        downloader.with_system_proxy(false)
    } else if let Some(proxy_url) = &http.proxy {
        let mut proxy = ProxyConfig::new(proxy_url.clone(), http.proxy_type);
        if let (Some(user), Some(pass)) = (&http.proxy_user, &http.proxy_pass) {
            proxy = proxy.with_auth(user.clone(), pass.clone());
        }
        info!(
            proxy_url = %proxy_url,
            proxy_type = ?http.proxy_type,
            has_auth = proxy.auth.is_some(),
            "Using explicit proxy configuration for downloads"
        );
        downloader.with_proxy(proxy)
    } else {
        downloader.with_system_proxy(true)
    };

    let chunk_size = parse_size(&storage.chunk_size)?;
    let chunk_size = u32::try_from(chunk_size)
        .ok()
        .filter(|&size| size > 0)
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "chunk size must be between 1 B and 4 GB, got {}",
                storage.chunk_size
            ))
        })?;
    let flush_threshold = usize::try_from(parse_size(&storage.flush_threshold)?)
        .map_err(|_| AppError::InvalidInput("flush threshold too large".to_string()))?;

    let mut builder = ManagerConfig::builder()
        .with_chunk_size(chunk_size)
        .with_flush_threshold(flush_threshold)
        .with_store_path(&storage.store_dir)
        .with_cache_path(&storage.cache_dir)
        .with_downloader(downloader.build());
    if let Some(jobs) = jobs {
        builder = builder.with_max_concurrent_downloads(jobs);
    }
    if let Some(quota) = &storage.quota {
        let quota = parse_size(quota)?;
        debug!(quota = %format_bytes(quota), "Chunk store quota");
        builder = builder.with_store_quota(quota);
    }

    Ok(builder.build())
}
