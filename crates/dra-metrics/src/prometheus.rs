//! Prometheus text exposition format.

use crate::collector::AllocationSnapshot;

fn counter(out: &mut String, name: &str, help: &str, snapshots: &[AllocationSnapshot], value: impl Fn(&AllocationSnapshot) -> u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for s in snapshots {
        out.push_str(&format!("{name}{{controller=\"{}\"}} {}\n", s.controller, value(s)));
    }
}

/// Render snapshots as COUNTER metrics with a `controller` label.
pub fn render_prometheus(snapshots: &[AllocationSnapshot]) -> String {
    let mut out = String::new();

    counter(&mut out, "dra_allocations_total", "Claims allocated.", snapshots, |s| s.allocations);
    counter(
        &mut out,
        "dra_ledger_conflicts_total",
        "Allocations that lost a counter or device race and were retried.",
        snapshots,
        |s| s.ledger_conflicts,
    );
    counter(
        &mut out,
        "dra_status_conflicts_total",
        "Claim status writes rejected for a stale version.",
        snapshots,
        |s| s.status_conflicts,
    );
    counter(&mut out, "dra_reservations_total", "Consumers added to reservedFor.", snapshots, |s| s.reservations);
    counter(&mut out, "dra_evictions_total", "Consumers evicted for NoExecute taints.", snapshots, |s| s.evictions);
    counter(&mut out, "dra_deallocations_total", "Allocations released.", snapshots, |s| s.deallocations);

    out.push_str("# HELP dra_allocation_failures_total Failed allocation attempts by reason.\n");
    out.push_str("# TYPE dra_allocation_failures_total counter\n");
    for s in snapshots {
        for (reason, count) in &s.failures {
            out.push_str(&format!(
                "dra_allocation_failures_total{{controller=\"{}\",reason=\"{reason}\"}} {count}\n",
                s.controller
            ));
        }
    }

    out
}
