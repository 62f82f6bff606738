//! Prometheus text exposition format.
//!
//! Renders replication counters and per-repository read traffic for
//! scraping by a Prometheus server or compatible agent.

use gitgrid_state::RepoId;

use crate::replication::ReplicationSnapshot;

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
    out.push_str(&format!("{name} {value}\n"));
}

/// Render replication counters and the current traffic window.
pub fn render_prometheus(replication: &ReplicationSnapshot, traffic: &[(RepoId, u64)]) -> String {
    let mut out = String::new();

    push_metric(
        &mut out,
        "gitgrid_replication_pending_tasks",
        "gauge",
        "Pending replication tasks seen by the last worker poll.",
        replication.pending,
    );
    push_metric(
        &mut out,
        "gitgrid_replication_tasks_enqueued_total",
        "counter",
        "Replication tasks inserted.",
        replication.enqueued,
    );
    push_metric(
        &mut out,
        "gitgrid_replication_tasks_succeeded_total",
        "counter",
        "Replication tasks completed successfully.",
        replication.succeeded,
    );
    push_metric(
        &mut out,
        "gitgrid_replication_tasks_failed_total",
        "counter",
        "Replication task executions that failed.",
        replication.failed,
    );
    push_metric(
        &mut out,
        "gitgrid_replication_tasks_dead_lettered_total",
        "counter",
        "Replication tasks moved to the dead-letter store.",
        replication.dead_lettered,
    );
    push_metric(
        &mut out,
        "gitgrid_routing_failovers_total",
        "counter",
        "Primary promotions performed.",
        replication.failovers,
    );

    out.push_str("# HELP gitgrid_repository_reads Reads routed in the current traffic window.\n");
    out.push_str("# TYPE gitgrid_repository_reads gauge\n");
    for (repo_id, count) in traffic {
        out.push_str(&format!(
            "gitgrid_repository_reads{{repo=\"{repo_id}\"}} {count}\n"
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        let output = render_prometheus(&ReplicationSnapshot::default(), &[]);
        assert!(output.contains("# TYPE gitgrid_replication_pending_tasks gauge"));
        assert!(output.contains("gitgrid_routing_failovers_total 0"));
        assert!(output.contains("# TYPE gitgrid_repository_reads gauge"));
    }

    #[test]
    fn render_values_and_labels() {
        let snapshot = ReplicationSnapshot {
            pending: 4,
            enqueued: 10,
            succeeded: 7,
            failed: 2,
            dead_lettered: 1,
            failovers: 3,
        };
        let output = render_prometheus(&snapshot, &[(1, 25), (9, 3)]);

        assert!(output.contains("gitgrid_replication_pending_tasks 4"));
        assert!(output.contains("gitgrid_replication_tasks_enqueued_total 10"));
        assert!(output.contains("gitgrid_replication_tasks_dead_lettered_total 1"));
        assert!(output.contains("gitgrid_repository_reads{repo=\"1\"} 25"));
        assert!(output.contains("gitgrid_repository_reads{repo=\"9\"} 3"));
    }

    #[test]
    fn every_sample_line_has_a_value() {
        let output = render_prometheus(&ReplicationSnapshot::default(), &[(5, 1)]);
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert_eq!(line.split_whitespace().count(), 2, "bad sample line: {line}");
        }
    }
}
