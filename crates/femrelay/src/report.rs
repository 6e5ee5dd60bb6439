//! Read-only reports: `femrelay check` and `femrelay transitions`.

use femrelay_cli::CheckArgs;
use femrelay_sched::{JobRequirement, assess, check_compatibility};
use femrelay_state::{Job, JobStatus, Node, is_terminal, next_possible_states};
use femrelay_store::{JobRepository, MemoryStore, NodeRepository};
use miette::{IntoDiagnostic, Result, miette};
use std::fmt::Write;

pub fn check_job(args: &CheckArgs) -> Result<()> {
    let store = MemoryStore::load(&args.state.state_file).into_diagnostic()?;
    let job = store
        .find_job_by_id(args.job_id)
        .into_diagnostic()?
        .ok_or_else(|| miette!("Job {} not found in {}", args.job_id, args.state.state_file))?;
    let nodes = store.find_all_nodes().into_diagnostic()?;
    let jobs = store.snapshot().into_diagnostic()?.jobs;

    print!("{}", render_check(&job, &nodes, &jobs));
    Ok(())
}

pub fn transitions(status: &str) -> Result<()> {
    let status: JobStatus = status.parse().into_diagnostic()?;
    print!("{}", render_transitions(status));
    Ok(())
}

/// Per-node capability and compatibility for `job`.
fn render_check(job: &Job, nodes: &[Node], jobs: &[Job]) -> String {
    let requirement = JobRequirement::from(job);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Job {} \"{}\" [{}]: {} CPU cores, {} license tokens",
        job.id,
        job.name,
        job.status,
        requirement.cpu_cores,
        requirement.license_tokens
    );

    if nodes.is_empty() {
        let _ = writeln!(out, "  no nodes configured");
        return out;
    }

    for node in nodes {
        let placed: Vec<Job> = jobs
            .iter()
            .filter(|j| j.node_id == Some(node.id) && j.id != job.id)
            .cloned()
            .collect();
        let capability = assess(node, &placed);
        let compatibility = check_compatibility(&requirement, node, &placed);

        let _ = writeln!(
            out,
            "  {} {} ({}:{}) {}/{} cores used, {:.1}% -> {:.1}%",
            if compatibility.compatible { "✓" } else { "✗" },
            node.name,
            node.hostname,
            node.port,
            capability.used_cpu_cores,
            node.cpu_cores_limit,
            capability.cpu_utilization,
            compatibility.utilization_after
        );
        for reason in &compatibility.reasons {
            let _ = writeln!(out, "      - {}", reason);
        }
    }
    out
}

fn render_transitions(status: JobStatus) -> String {
    if is_terminal(status) {
        return format!("{} is terminal\n", status);
    }
    let next: Vec<&str> = next_possible_states(status)
        .iter()
        .map(|s| s.as_str())
        .collect();
    format!("{} -> {}\n", status, next.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, limit: u32) -> Node {
        let mut node = Node::new(id, format!("solver{}", id), format!("10.0.0.{}", id));
        node.username = "fea".to_string();
        node.cpu_cores_limit = limit;
        node
    }

    #[test]
    fn test_render_check() {
        let job = Job::new(1, "beam", 1, 4);
        let mut busy = Job::new(2, "plate", 2, 6);
        busy.status = JobStatus::Running;
        busy.node_id = Some(2);

        let report = render_check(&job, &[node(1, 8), node(2, 8)], &[job.clone(), busy]);
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines[0], "Job 1 \"beam\" [waiting]: 4 CPU cores, 8 license tokens");
        assert_eq!(lines[1], "  ✓ solver1 (10.0.0.1:22) 0/8 cores used, 0.0% -> 50.0%");
        assert!(lines[2].starts_with("  ✗ solver2"));
        assert_eq!(lines[3], "      - node has 2 of 8 CPU cores free, job requires 4");
    }

    #[test]
    fn test_render_transitions() {
        assert_eq!(render_transitions(JobStatus::Waiting), "waiting -> starting, failed\n");
        assert_eq!(render_transitions(JobStatus::Completed), "completed is terminal\n");
    }
}
