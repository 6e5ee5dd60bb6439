//! Matching jobs against node capacity.
//!
//! Pure functions over nodes and the jobs currently placed on them.

use femrelay_state::{Job, Node, NodeId};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

/// Utilization (percent) at or above which a node takes no more work.
pub const CRITICAL_UTILIZATION: f64 = 95.0;

/// Upper bound of a sane per-node core limit.
pub const MAX_CPU_CORES: u32 = 1024;

/// License tokens a single-core analysis checks out.
pub const SINGLE_CORE_TOKENS: f64 = 5.0;

/// Queue time assumed per active job when ranking nodes.
pub const ESTIMATED_JOB_DURATION: Duration = Duration::from_secs(30 * 60);

/// License tokens needed to run on `cores` cores.
pub fn license_tokens(cores: u32) -> u32 {
    if cores == 0 {
        return 0;
    }
    (SINGLE_CORE_TOKENS * f64::from(cores).powf(0.422)).floor() as u32
}

/// Resources a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobRequirement {
    pub cpu_cores: u32,
    pub license_tokens: u32,
}

impl JobRequirement {
    pub fn new(cpu_cores: u32) -> Self {
        Self {
            cpu_cores,
            license_tokens: license_tokens(cpu_cores),
        }
    }
}

impl From<&Job> for JobRequirement {
    fn from(job: &Job) -> Self {
        Self::new(job.cpu_cores)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCapability {
    pub node_id: NodeId,
    /// Percent of the core limit held by active jobs
    pub cpu_utilization: f64,
    pub can_execute: bool,
    pub recommended_cpu_cores: u32,
    pub max_license_tokens: u32,
    pub used_cpu_cores: u32,
    pub available_cpu_cores: u32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compatibility {
    pub compatible: bool,
    pub reasons: Vec<String>,
    /// Utilization the node would reach with the job placed on it
    pub utilization_after: f64,
}

/// Problems with the node's own settings.
pub fn configuration_issues(node: &Node) -> Vec<String> {
    let mut issues = Vec::new();
    if node.name.trim().is_empty() {
        issues.push("node name is empty".to_string());
    }
    if node.hostname.trim().is_empty() {
        issues.push("hostname is empty".to_string());
    }
    if node.port == 0 {
        issues.push("port must be between 1 and 65535".to_string());
    }
    if !(1..=MAX_CPU_CORES).contains(&node.cpu_cores_limit) {
        issues.push(format!(
            "CPU core limit {} is outside 1..={}",
            node.cpu_cores_limit, MAX_CPU_CORES
        ));
    }
    issues
}

/// Cores held by the active jobs in `jobs`.
pub fn used_cpu_cores(jobs: &[Job]) -> u32 {
    jobs.iter()
        .filter(|j| j.is_active())
        .map(|j| j.cpu_cores)
        .sum()
}

fn utilization(used: u32, limit: u32) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    f64::from(used) * 100.0 / f64::from(limit)
}

/// Assess a node given the jobs currently placed on it.
pub fn assess(node: &Node, current_jobs: &[Job]) -> NodeCapability {
    let issues = configuration_issues(node);
    let used = used_cpu_cores(current_jobs);
    let cpu_utilization = utilization(used, node.cpu_cores_limit);
    let available = node.cpu_cores_limit.saturating_sub(used);

    let mut reasons = issues.clone();
    if !node.is_available() {
        reasons.push("node is not available".to_string());
    }
    if cpu_utilization >= CRITICAL_UTILIZATION {
        reasons.push(format!(
            "CPU utilization {:.1}% is at or above {:.0}%",
            cpu_utilization, CRITICAL_UTILIZATION
        ));
    }

    let max_license_tokens = if node.license_token_limit > 0 {
        node.license_token_limit
    } else {
        license_tokens(node.cpu_cores_limit)
    };

    NodeCapability {
        node_id: node.id,
        cpu_utilization,
        can_execute: reasons.is_empty(),
        recommended_cpu_cores: available,
        max_license_tokens,
        used_cpu_cores: used,
        available_cpu_cores: available,
        issues: reasons,
    }
}

/// Can `node` take a job with `requirement` on top of `current_jobs`?
pub fn check_compatibility(
    requirement: &JobRequirement,
    node: &Node,
    current_jobs: &[Job],
) -> Compatibility {
    let capability = assess(node, current_jobs);
    let mut reasons = Vec::new();

    if requirement.cpu_cores > node.cpu_cores_limit {
        reasons.push(format!(
            "job requires {} CPU cores but node limit is {}",
            requirement.cpu_cores, node.cpu_cores_limit
        ));
    }
    if !node.is_available() {
        reasons.push(format!("node {} is not available", node.name));
    }
    if capability.used_cpu_cores.saturating_add(requirement.cpu_cores) > node.cpu_cores_limit {
        reasons.push(format!(
            "node has {} of {} CPU cores free, job requires {}",
            capability.available_cpu_cores, node.cpu_cores_limit, requirement.cpu_cores
        ));
    }
    if node.license_token_limit > 0 && requirement.license_tokens > node.license_token_limit {
        reasons.push(format!(
            "job requires {} license tokens but node allows {}",
            requirement.license_tokens, node.license_token_limit
        ));
    }
    if !capability.can_execute {
        for issue in capability.issues {
            if !reasons.contains(&issue) {
                reasons.push(issue);
            }
        }
    }

    Compatibility {
        compatible: reasons.is_empty(),
        reasons,
        utilization_after: utilization(
            capability.used_cpu_cores.saturating_add(requirement.cpu_cores),
            node.cpu_cores_limit,
        ),
    }
}

/// Rough wait before a new job would start on a node.
pub fn estimated_queue_time(current_jobs: &[Job]) -> Duration {
    let active = current_jobs.iter().filter(|j| j.is_active()).count() as u32;
    ESTIMATED_JOB_DURATION * active
}

/// Pick the best compatible node for `job`.
///
/// Ranked by utilization ascending, then core limit descending, then estimated
/// queue time ascending.
pub fn select_optimal<'a>(
    job: &Job,
    nodes: &'a [Node],
    current_jobs_per_node: &HashMap<NodeId, Vec<Job>>,
) -> Option<&'a Node> {
    let requirement = JobRequirement::from(job);
    let empty = Vec::new();

    let mut candidates: Vec<(&Node, f64, Duration)> = nodes
        .iter()
        .filter_map(|node| {
            let jobs = current_jobs_per_node.get(&node.id).unwrap_or(&empty);
            if !check_compatibility(&requirement, node, jobs).compatible {
                return None;
            }
            let capability = assess(node, jobs);
            Some((node, capability.cpu_utilization, estimated_queue_time(jobs)))
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.0.cpu_cores_limit.cmp(&a.0.cpu_cores_limit))
            .then_with(|| a.2.cmp(&b.2))
    });

    candidates.first().map(|(node, _, _)| *node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use femrelay_state::{JobStatus, NodeStatus};

    fn node(id: NodeId, limit: u32) -> Node {
        let mut node = Node::new(id, format!("node{}", id), format!("10.0.0.{}", id));
        node.username = "fea".to_string();
        node.cpu_cores_limit = limit;
        node
    }

    fn running(id: i64, node_id: NodeId, cores: u32) -> Job {
        let mut job = Job::new(id, format!("job{}", id), 1, cores);
        job.status = JobStatus::Running;
        job.node_id = Some(node_id);
        job
    }

    #[test]
    fn test_license_tokens() {
        assert_eq!(license_tokens(1), 5);
        assert_eq!(license_tokens(4), 8);
        assert_eq!(license_tokens(8), 12);
        assert_eq!(license_tokens(16), 16);
        assert_eq!(license_tokens(0), 0);
    }

    #[test]
    fn test_compatibility_core_limit() {
        let node = node(1, 8);

        let fits = check_compatibility(&JobRequirement::new(4), &node, &[]);
        assert!(fits.compatible);
        assert!(fits.reasons.is_empty());
        assert_eq!(fits.utilization_after, 50.0);

        let too_big = check_compatibility(&JobRequirement::new(10), &node, &[]);
        assert!(!too_big.compatible);
        assert_eq!(too_big.reasons[0], "job requires 10 CPU cores but node limit is 8");
    }

    #[test]
    fn test_compatibility_counts_running_jobs() {
        let node = node(1, 8);
        let jobs = vec![running(1, 1, 6)];

        let result = check_compatibility(&JobRequirement::new(4), &node, &jobs);
        assert!(!result.compatible);
        assert!(result.reasons[0].contains("2 of 8 CPU cores free"));

        // Finished jobs hold no cores
        let mut done = running(2, 1, 6);
        done.status = JobStatus::Completed;
        assert!(check_compatibility(&JobRequirement::new(4), &node, &[done]).compatible);
    }

    #[test]
    fn test_compatibility_license_limit() {
        let mut node = node(1, 16);
        node.license_token_limit = 10;
        assert!(check_compatibility(&JobRequirement::new(4), &node, &[]).compatible);

        let result = check_compatibility(&JobRequirement::new(16), &node, &[]);
        assert!(!result.compatible);
        assert!(result.reasons[0].contains("license tokens"));
    }

    #[test]
    fn test_assess_unavailable_and_misconfigured() {
        let mut offline = node(1, 8);
        offline.status = NodeStatus::Unavailable;
        assert!(!assess(&offline, &[]).can_execute);

        let mut broken = node(2, 0);
        broken.hostname = String::new();
        let capability = assess(&broken, &[]);
        assert!(!capability.can_execute);
        assert!(capability.issues.iter().any(|i| i == "hostname is empty"));
        assert!(capability.issues.iter().any(|i| i.contains("CPU core limit 0")));
    }

    #[test]
    fn test_assess_critical_utilization() {
        let node = node(1, 20);
        let busy = assess(&node, &[running(1, 1, 19)]);
        assert_eq!(busy.cpu_utilization, 95.0);
        assert!(!busy.can_execute);
        assert_eq!(busy.available_cpu_cores, 1);

        let fine = assess(&node, &[running(1, 1, 18)]);
        assert!(fine.can_execute);
        assert_eq!(fine.max_license_tokens, license_tokens(20));
    }

    #[test]
    fn test_select_optimal_prefers_idle_then_larger() {
        let nodes = vec![node(1, 8), node(2, 8), node(3, 16)];
        let mut placed = HashMap::new();
        placed.insert(1, vec![running(10, 1, 2)]);

        let job = Job::new(99, "beam", 1, 4);
        let chosen = select_optimal(&job, &nodes, &placed).unwrap();
        // Nodes 2 and 3 are idle; 3 has more cores
        assert_eq!(chosen.id, 3);

        let big = Job::new(100, "plate", 1, 12);
        assert_eq!(select_optimal(&big, &nodes, &placed).unwrap().id, 3);

        let huge = Job::new(101, "hull", 1, 64);
        assert!(select_optimal(&huge, &nodes, &placed).is_none());
    }

    #[test]
    fn test_estimated_queue_time() {
        let jobs = vec![running(1, 1, 1), running(2, 1, 1)];
        assert_eq!(estimated_queue_time(&jobs), Duration::from_secs(3600));
        assert_eq!(estimated_queue_time(&[]), Duration::ZERO);
    }
}
