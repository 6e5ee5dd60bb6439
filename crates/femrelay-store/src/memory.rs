use crate::repository::{FileRepository, JobRepository, NodeRepository, StoreError};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use femrelay_state::{FileId, FileRecord, Job, JobId, JobStatus, Node, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Serialized form of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// In-memory implementation of every repository trait.
///
/// Can be seeded from and written back to a JSON snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StoreData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Load a snapshot from disk.
    ///
    /// Returns an empty store if the file doesn't exist.
    pub fn load(path: &Utf8Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(Self::from_data(serde_json::from_str(&content)?))
    }

    /// Write a snapshot to disk.
    ///
    /// Creates parent directories if needed.
    pub fn save(&self, path: &Utf8Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*self.read()?)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<StoreData, StoreError> {
        Ok(self.read()?.clone())
    }

    /// Insert or replace a job by id.
    pub fn upsert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut data = self.write()?;
        match data.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => data.jobs.push(job),
        }
        Ok(())
    }

    pub fn upsert_node(&self, node: Node) -> Result<(), StoreError> {
        let mut data = self.write()?;
        match data.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => data.nodes.push(node),
        }
        Ok(())
    }

    pub fn upsert_file(&self, file: FileRecord) -> Result<(), StoreError> {
        let mut data = self.write()?;
        match data.files.iter_mut().find(|f| f.id == file.id) {
            Some(existing) => *existing = file,
            None => data.files.push(file),
        }
        Ok(())
    }

    /// Flip node availability, as an external health check would.
    pub fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<(), StoreError> {
        let mut data = self.write()?;
        if let Some(node) = data.nodes.iter_mut().find(|n| n.id == id) {
            node.status = status;
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreData>, StoreError> {
        self.data.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreData>, StoreError> {
        self.data.write().map_err(|_| StoreError::Poisoned)
    }

    fn with_job<F>(&self, id: JobId, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut data = self.write()?;
        let job = data
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(StoreError::JobNotFound(id))?;
        update(job);
        Ok(())
    }
}

impl JobRepository for MemoryStore {
    fn find_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .read()?
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    fn find_job_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.status = status;
            if let Some(message) = message {
                job.error_message = Some(message.to_string());
            }
        })
    }

    fn update_start_time(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_job(id, |job| job.start_time = Some(at))
    }

    fn update_end_time(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_job(id, |job| job.end_time = Some(at))
    }

    fn assign_node(&self, id: JobId, node_id: NodeId) -> Result<(), StoreError> {
        self.with_job(id, |job| job.node_id = Some(node_id))
    }
}

impl NodeRepository for MemoryStore {
    fn find_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.read()?.nodes.clone())
    }

    fn find_node_by_id(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.read()?.nodes.iter().find(|n| n.id == id).cloned())
    }
}

impl FileRepository for MemoryStore {
    fn find_file_by_id(&self, id: FileId) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.read()?.files.iter().find(|f| f.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_job(Job::new(1, "beam", 10, 4)).unwrap();
        store.upsert_job(Job::new(2, "plate", 11, 2)).unwrap();
        store.upsert_node(Node::new(1, "solver-a", "10.0.0.5")).unwrap();
        store
    }

    #[test]
    fn test_find_by_status() {
        let store = seeded();
        store
            .update_job_status(2, JobStatus::Failed, Some("boom"))
            .unwrap();

        let waiting = store.find_jobs_by_status(JobStatus::Waiting).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, 1);

        let failed = store.find_job_by_id(2).unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_update_missing_job() {
        let store = seeded();
        let result = store.update_start_time(99, Utc::now());
        assert!(matches!(result, Err(StoreError::JobNotFound(99))));
    }

    #[test]
    fn test_assign_node_and_times() {
        let store = seeded();
        let now = Utc::now();
        store.assign_node(1, 1).unwrap();
        store.update_start_time(1, now).unwrap();
        store.update_end_time(1, now).unwrap();

        let job = store.find_job_by_id(1).unwrap().unwrap();
        assert_eq!(job.node_id, Some(1));
        assert_eq!(job.start_time, Some(now));
        assert_eq!(job.end_time, Some(now));
    }

    #[test]
    fn test_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let path = Utf8Path::from_path(temp.path()).unwrap().join("state.json");
        let store = MemoryStore::load(&path).unwrap();
        assert!(store.find_all_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = Utf8Path::from_path(temp.path())
            .unwrap()
            .join("nested")
            .join("state.json");

        let store = seeded();
        store.set_node_status(1, NodeStatus::Unavailable).unwrap();
        store.save(&path).unwrap();
        assert!(path.exists());

        let loaded = MemoryStore::load(&path).unwrap();
        assert_eq!(loaded.find_jobs_by_status(JobStatus::Waiting).unwrap().len(), 2);
        let node = loaded.find_node_by_id(1).unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Unavailable);
    }
}
