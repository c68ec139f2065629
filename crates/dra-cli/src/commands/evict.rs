use std::time::Duration;

use dra_controller::{ClaimController, epoch_secs};
use dra_metrics::render_prometheus;
use tokio::sync::watch;
use tracing::info;

pub async fn evictions(controller: &ClaimController, sweep: bool, now: Option<u64>) -> anyhow::Result<()> {
    let now = now.unwrap_or_else(epoch_secs);

    for claim in controller.store().list_claims()? {
        if claim.status.allocation.is_none() {
            continue;
        }
        let key = claim.key();
        let plan = controller.eviction_plan(&key, now)?;
        for taint in &plan.taints {
            let when = if taint.deadline <= now {
                "due".to_string()
            } else {
                format!("in {}s", taint.deadline - now)
            };
            println!("{key}  {}  taint {}  {when}", taint.device, taint.taint_key);
        }
    }

    if sweep {
        let report = controller.sweep_evictions(now).await?;
        for order in &report.evicted {
            println!(
                "✓ Evicted {}/{} from {} ({})",
                order.consumer.resource, order.consumer.name, order.claim, order.taint_key
            );
        }
        for failure in &report.failed {
            eprintln!("✗ {}: {}", failure.claim, failure.error);
        }
        if !report.is_complete() {
            anyhow::bail!("eviction failed for {} claim(s)", report.failed.len());
        }
        if report.evicted.is_empty() {
            println!("Nothing to evict");
        }
    }
    Ok(())
}

/// Sweep evictions until Ctrl-C, then print the collected metrics.
pub async fn run(controller: ClaimController, interval_ms: u64) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    controller
        .run_evictions(Duration::from_millis(interval_ms), shutdown_rx)
        .await;

    let snapshots: Vec<_> = controller.metrics().snapshot().into_iter().collect();
    print!("{}", render_prometheus(&snapshots));
    Ok(())
}
