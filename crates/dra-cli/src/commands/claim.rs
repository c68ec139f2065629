use dra_allocator::BindingOutcome;
use dra_controller::ClaimController;
use dra_core::{ConsumerReference, NodeInfo};

/// Parse a `key=value` node label.
pub fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

pub async fn allocate(
    controller: &ClaimController,
    key: &str,
    node: Option<String>,
    labels: Vec<(String, String)>,
) -> anyhow::Result<()> {
    if node.is_none() && !labels.is_empty() {
        anyhow::bail!("--label requires --node");
    }
    let node = node.map(|name| {
        labels
            .into_iter()
            .fold(NodeInfo::new(name), |node, (k, v)| node.with_label(k, v))
    });

    let claim = controller.allocate(key, node).await?;
    println!("✓ Allocated {}", claim.key());
    if let Some(allocation) = &claim.status.allocation {
        for entry in &allocation.results {
            let admin = if entry.admin_access() { "  (admin)" } else { "" };
            println!("  {}: {}{}", entry.request, entry.device_id(), admin);
        }
        if let Some(selector) = &allocation.node_selector {
            println!("  Node selector: {}", serde_json::to_string(selector)?);
        }
    }
    Ok(())
}

pub async fn bind(controller: &ClaimController, key: &str) -> anyhow::Result<()> {
    match controller.bind(key).await? {
        BindingOutcome::Ready => println!("✓ {key} is ready to bind"),
        BindingOutcome::Pending { device, conditions } => {
            println!("… {key} waits on {device}: {}", conditions.join(", "));
        }
        BindingOutcome::Failed { device, condition } => {
            anyhow::bail!("{key}: binding failed on {device} ({condition})");
        }
    }
    Ok(())
}

pub async fn reserve(
    controller: &ClaimController,
    key: &str,
    resource: &str,
    name: &str,
    uid: &str,
) -> anyhow::Result<()> {
    let claim = controller
        .reserve(key, ConsumerReference::new(resource, name, uid))
        .await?;
    println!(
        "✓ Reserved {} for {resource}/{name} ({} consumers)",
        claim.key(),
        claim.status.reserved_for.len()
    );
    Ok(())
}

pub async fn unreserve(controller: &ClaimController, key: &str, uid: &str) -> anyhow::Result<()> {
    let claim = controller.unreserve(key, uid).await?;
    println!(
        "✓ Released {uid} from {} ({} consumers left)",
        claim.key(),
        claim.status.reserved_for.len()
    );
    Ok(())
}

pub async fn deallocate(controller: &ClaimController, key: &str) -> anyhow::Result<()> {
    let claim = controller.deallocate(key).await?;
    println!("✓ Deallocated {}", claim.key());
    Ok(())
}
