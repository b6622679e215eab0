use std::time::Duration;

use siphon_core::{load_or_default, DownloadManager, JobOutcome, JobSnapshot};
use tokio::time::sleep;

use crate::{Cli, FetchArgs, OutputFormat, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(cli: &Cli, args: &FetchArgs) -> Result<()> {
    let mut config = load_or_default(&cli.config);
    if let Some(limit) = args.limit {
        config.limits.max_concurrent_downloads = limit;
    }
    let mut builder = DownloadManager::builder(&cli.config).config(config);
    if let Some(dest) = &args.dest {
        builder = builder.download_dir(dest);
    }
    let manager = builder.build()?;

    let mut ids = Vec::new();
    for url in &args.urls {
        ids.push(manager.submit(url)?);
    }

    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, cancelling downloads");
                for id in &ids {
                    manager.cancel(id);
                }
            }
            _ = sleep(POLL_INTERVAL) => {}
        }

        let snapshots: Vec<JobSnapshot> = ids
            .iter()
            .filter_map(|id| manager.job(id))
            .collect();
        if matches!(cli.format, OutputFormat::Text) {
            for snapshot in &snapshots {
                render_line(snapshot);
            }
        }
        if snapshots.iter().all(|snapshot| snapshot.outcome.is_some()) {
            break snapshots;
        }
    };

    manager.shutdown().await;

    if matches!(cli.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    }
    let failed = finished
        .iter()
        .filter(|snapshot| snapshot.outcome == Some(JobOutcome::Failed))
        .count();
    if failed > 0 {
        return Err(siphon_core::DownloadError::Backend(format!(
            "{failed} download(s) failed"
        ))
        .into());
    }
    Ok(())
}

fn render_line(snapshot: &JobSnapshot) {
    let speed = if snapshot.speed.is_empty() {
        String::new()
    } else {
        format!(" @ {}", snapshot.speed)
    };
    println!(
        "[{}] {:>5.1}% {}{}",
        &snapshot.id[..8],
        snapshot.progress,
        snapshot.status,
        speed
    );
}
