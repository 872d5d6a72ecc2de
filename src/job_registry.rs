use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorKind, GenerationError};
use crate::normalizer::ModeTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub uid: Uuid,
    pub mode: Option<ModeTag>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<PathBuf>,
    pub failure: Option<JobFailure>,
}

impl JobRecord {
    pub fn new(uid: Uuid) -> Self {
        Self {
            uid,
            mode: None,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifact: None,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// 进程内的任务状态表。
/// 结果文件仍是“完成”的依据；这里补上文件本身表达不了的失败状态。
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uid: Uuid) -> JobRecord {
        let record = JobRecord::new(uid);
        let mut guard = self.jobs.write();
        guard.insert(uid, record.clone());
        record
    }

    pub fn get(&self, uid: &Uuid) -> Option<JobRecord> {
        let guard = self.jobs.read();
        guard.get(uid).cloned()
    }

    pub fn remove(&self, uid: &Uuid) -> Option<JobRecord> {
        let mut guard = self.jobs.write();
        guard.remove(uid)
    }

    pub fn set_mode(&self, uid: &Uuid, mode: ModeTag) -> Option<JobRecord> {
        self.update(uid, |job| job.mode = Some(mode))
    }

    pub fn mark_running(&self, uid: &Uuid) -> Option<JobRecord> {
        self.update(uid, |job| {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        })
    }

    pub fn mark_completed(&self, uid: &Uuid, artifact: PathBuf) -> Option<JobRecord> {
        self.update(uid, |job| {
            job.state = JobState::Completed;
            job.finished_at = Some(Utc::now());
            job.artifact = Some(artifact);
        })
    }

    pub fn mark_failed(&self, uid: &Uuid, error: &GenerationError) -> Option<JobRecord> {
        self.update(uid, |job| {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            job.failure = Some(JobFailure {
                kind: error.kind(),
                message: error.to_string(),
            });
        })
    }

    fn update(&self, uid: &Uuid, f: impl FnOnce(&mut JobRecord)) -> Option<JobRecord> {
        let mut guard = self.jobs.write();
        let job = guard.get_mut(uid)?;
        f(job);
        Some(job.clone())
    }

    pub fn counts(&self) -> JobCounts {
        let guard = self.jobs.read();
        let mut counts = JobCounts::default();
        for job in guard.values() {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// 删除在 `cutoff` 之前结束的记录，返回删除条数；未结束的任务保留
    pub fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.jobs.write();
        let before = guard.len();
        guard.retain(|_, job| job.finished_at.map_or(true, |t| t >= cutoff));
        before - guard.len()
    }
}
