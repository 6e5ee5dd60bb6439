//! Job, node and file records shared across the workspace.

use crate::status::{self, JobStatus};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = i64;
pub type NodeId = i64;
pub type FileId = i64;
pub type UserId = i64;

/// One analysis run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    pub name: String,

    pub status: JobStatus,

    /// Node explicitly requested for this job, or the node it was dispatched to
    pub node_id: Option<NodeId>,

    pub user_id: UserId,

    /// Input deck uploaded for this job
    pub file_id: FileId,

    /// Requested CPU cores (at least 1)
    pub cpu_cores: u32,

    /// Higher runs first
    #[serde(default)]
    pub priority: i32,

    pub start_time: Option<DateTime<Utc>>,

    pub end_time: Option<DateTime<Utc>>,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a waiting job.
    pub fn new(id: JobId, name: impl Into<String>, file_id: FileId, cpu_cores: u32) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Waiting,
            node_id: None,
            user_id: 0,
            file_id,
            cpu_cores: cpu_cores.max(1),
            priority: 0,
            start_time: None,
            end_time: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        status::is_active(self.status)
    }
}

/// Node availability as reported by external health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Available,
    Unavailable,
}

/// Remote worker host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// Display name, also used in remote working directory paths
    pub name: String,

    pub hostname: String,

    /// Remote-shell login
    pub username: String,

    pub port: u16,

    pub cpu_cores_limit: u32,

    /// Zero means the node does not meter license tokens
    #[serde(default)]
    pub license_token_limit: u32,

    #[serde(default)]
    pub status: NodeStatus,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            hostname: hostname.into(),
            username: String::new(),
            port: 22,
            cpu_cores_limit: 1,
            license_token_limit: 0,
            status: NodeStatus::Available,
            is_active: true,
        }
    }

    /// Active and reported available.
    pub fn is_available(&self) -> bool {
        self.is_active && self.status == NodeStatus::Available
    }

    pub fn connection(&self) -> NodeConnection {
        NodeConnection {
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            port: self.port,
        }
    }
}

/// Remote-shell connection details for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeConnection {
    pub hostname: String,
    pub username: String,
    pub port: u16,
}

impl NodeConnection {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port,
        }
    }

    /// Identity used to serialize transfers against one host.
    pub fn queue_key(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Uploaded input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,

    /// Name the user uploaded, e.g. `beam.inp`
    pub original_name: String,

    /// Local path of the stored copy
    pub stored_path: Utf8PathBuf,

    #[serde(default)]
    pub user_id: UserId,
}

impl FileRecord {
    /// Local directory holding the input deck.
    pub fn directory(&self) -> Utf8PathBuf {
        self.stored_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }

    /// File name the analysis is started with.
    pub fn input_name(&self) -> &str {
        self.stored_path
            .file_name()
            .unwrap_or(self.original_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new_is_waiting() {
        let job = Job::new(7, "beam", 3, 0);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.cpu_cores, 1);
        assert!(!job.is_active());
    }

    #[test]
    fn test_node_availability() {
        let mut node = Node::new(1, "solver-a", "10.0.0.5");
        assert!(node.is_available());

        node.status = NodeStatus::Unavailable;
        assert!(!node.is_available());

        node.status = NodeStatus::Available;
        node.is_active = false;
        assert!(!node.is_available());
    }

    #[test]
    fn test_queue_key() {
        let conn = NodeConnection::new("h", "u", 2222);
        assert_eq!(conn.queue_key(), "h:2222");
    }

    #[test]
    fn test_file_record_paths() {
        let file = FileRecord {
            id: 1,
            original_name: "beam.inp".to_string(),
            stored_path: "/srv/uploads/17/beam.inp".into(),
            user_id: 1,
        };
        assert_eq!(file.directory(), "/srv/uploads/17");
        assert_eq!(file.input_name(), "beam.inp");
    }

    #[test]
    fn test_node_defaults_from_json() {
        let node: Node = serde_json::from_str(
            r#"{"id":2,"name":"b","hostname":"h","username":"u","port":22,"cpu_cores_limit":8}"#,
        )
        .unwrap();
        assert!(node.is_active);
        assert_eq!(node.status, NodeStatus::Available);
        assert_eq!(node.license_token_limit, 0);
    }
}
