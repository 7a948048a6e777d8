use ferry_engine::{DownloadManager, QuotaDecision, VerifyFailure, VerifyReport};
use futures::future::join_all;
use indicatif::MultiProgress;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::utils::format_bytes;
use crate::utils::progress::ProgressManager;

/// Download every URL concurrently; the manager bounds how many actually run.
pub async fn ensure(
    manager: &DownloadManager,
    urls: &[String],
    on_quota: Option<QuotaDecision>,
    show_progress: bool,
) -> Result<(), AppError> {
    if let Some(decision) = on_quota {
        info!(?decision, "Quota decision preset");
        manager.set_quota_handler(decision);
    }

    let multi = MultiProgress::new();
    let progress = if show_progress {
        ProgressManager::new(multi)
    } else {
        ProgressManager::new_disabled(multi)
    };

    let downloads = urls.iter().map(|url| {
        let tracked = progress.track(url);
        async move {
            let sink = tracked.as_ref().map(|(_, sink)| sink.clone());
            let result = manager.ensure(url, sink).await;
            if let Some((bar, _)) = tracked {
                match &result {
                    Ok(()) => bar.finish_with_message(format!("{url} done")),
                    Err(e) => bar.abandon_with_message(format!("{url} failed: {e}")),
                }
            }
            (url, result)
        }
    });

    let mut failed = 0;
    for (url, result) in join_all(downloads).await {
        match result {
            Ok(()) => info!(url = %url, "Available in cache"),
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, kind = ?e.kind(), "Download failed");
            }
        }
    }

    if manager.is_memory_only() {
        warn!(
            decision = ?manager.quota_decision(),
            "Chunk store was unavailable, partial progress of this run was not persisted"
        );
    }
    summarize(failed, urls.len())
}

pub async fn verify(manager: &DownloadManager, urls: &[String]) -> Result<(), AppError> {
    let mut failed = 0;
    for url in urls {
        let report = manager.verify(url).await?;
        if !report.ok {
            failed += 1;
        }
        println!("{}", describe(url, &report));
    }
    summarize(failed, urls.len())
}

pub async fn evict(manager: &DownloadManager, urls: &[String]) -> Result<(), AppError> {
    for url in urls {
        manager.evict(url).await?;
        println!("evicted {url}");
    }
    Ok(())
}

pub async fn repair(manager: &DownloadManager, urls: &[String]) -> Result<(), AppError> {
    let mut failed = 0;
    for url in urls {
        match manager.repair(url, None).await {
            Ok(report) if report.ok => println!("{url}: ok"),
            Ok(report) => println!("{} (repaired)", describe(url, &report)),
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, "Repair failed");
            }
        }
    }
    summarize(failed, urls.len())
}

pub async fn status(manager: &DownloadManager) -> Result<(), AppError> {
    let mut pending = manager.pending().await?;
    if pending.is_empty() {
        println!("no partial downloads");
        return Ok(());
    }

    pending.sort_by(|a, b| a.url.cmp(&b.url));
    for meta in pending {
        let stored = meta.present_chunks() as u64 * meta.chunk_size as u64;
        println!(
            "{}: {}/{} chunks, ~{} of {}",
            meta.url,
            meta.present_chunks(),
            meta.total_chunks,
            format_bytes(stored.min(meta.total_bytes)),
            format_bytes(meta.total_bytes),
        );
    }
    Ok(())
}

pub async fn clear(manager: &DownloadManager) -> Result<(), AppError> {
    manager.clear_store().await?;
    println!("chunk store cleared");
    Ok(())
}

fn describe(url: &str, report: &VerifyReport) -> String {
    match report.reason {
        None => format!("{url}: ok"),
        Some(VerifyFailure::Missing) => format!("{url}: missing"),
        Some(VerifyFailure::SizeMismatch { declared, actual }) => {
            format!("{url}: damaged ({actual} of {declared} bytes)")
        }
    }
}

fn summarize(failed: usize, total: usize) -> Result<(), AppError> {
    if failed == 0 {
        Ok(())
    } else {
        Err(AppError::Incomplete { failed, total })
    }
}
