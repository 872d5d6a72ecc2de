//! 结果文件存储：`{cache_dir}/{uid}.{ext}`。
//!
//! 写入先落到临时文件再 rename，轮询方看到文件时内容一定完整。
//! 过期清理由 [`run_retention_daemon`] 周期执行，只删除文件名是 uid 的结果文件。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job_registry::JobRegistry;
use crate::mesh::ExportFormat;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, uid: &Uuid, format: ExportFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", uid, format.extension()))
    }

    pub async fn write(
        &self,
        uid: &Uuid,
        format: ExportFormat,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.path_for(uid, format);
        let partial = self.dir.join(format!(".{}.{}.partial", uid, format.extension()));
        let written = match tokio::fs::write(&partial, bytes).await {
            Ok(()) => tokio::fs::rename(&partial, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!(path = %partial.display(), error = %cleanup, "Failed to remove partial artifact");
            }
            return Err(e);
        }
        Ok(path)
    }

    /// 读取 uid 对应的结果；文件不存在时返回 `None`
    pub async fn read(&self, path: &Path) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 零表示永久保留
    pub max_age: Duration,
    pub interval: Duration,
}

impl RetentionPolicy {
    pub fn enabled(&self) -> bool {
        !self.max_age.is_zero()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub records_pruned: usize,
}

pub async fn run_retention_daemon(
    store: Arc<ArtifactStore>,
    registry: Arc<JobRegistry>,
    policy: RetentionPolicy,
    cancellation: CancellationToken,
) {
    if !policy.enabled() {
        info!("Artifact retention disabled, results are kept forever");
        return;
    }
    info!(
        dir = %store.dir().display(),
        max_age_secs = policy.max_age.as_secs(),
        interval_secs = policy.interval.as_secs(),
        "Starting artifact retention daemon"
    );

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                info!("Artifact retention daemon shutting down");
                break;
            }
            _ = tokio::time::sleep(policy.interval) => {
                let result = sweep(&store, &registry, policy.max_age).await;
                if result.files_deleted > 0 || result.records_pruned > 0 {
                    info!(
                        files_deleted = result.files_deleted,
                        bytes_freed = result.bytes_freed,
                        records_pruned = result.records_pruned,
                        "Expired artifacts removed"
                    );
                }
            }
        }
    }
}

pub async fn sweep(store: &ArtifactStore, registry: &JobRegistry, max_age: Duration) -> SweepResult {
    let dir = store.dir().to_path_buf();
    let mut result = tokio::task::spawn_blocking(move || sweep_blocking(&dir, max_age, SystemTime::now()))
        .await
        .unwrap_or_default();

    if let Ok(age) = chrono::Duration::from_std(max_age) {
        result.records_pruned = registry.prune_finished_before(chrono::Utc::now() - age);
    }
    result
}

fn sweep_blocking(dir: &Path, max_age: Duration, now: SystemTime) -> SweepResult {
    let mut result = SweepResult::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to scan artifact directory");
            return result;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_artifact(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let expired = now
            .duration_since(modified)
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if !expired {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                result.files_deleted += 1;
                result.bytes_freed += metadata.len();
            }
            Err(e) => {
                // 可能刚被别的请求删掉
                debug!(path = %path.display(), error = %e, "Failed to delete expired artifact");
            }
        }
    }
    result
}

// 只认 `{uuid}.{ext}` 和写到一半留下的 `.{uuid}.{ext}.partial`，日志等其他文件不动
fn is_artifact(path: &Path) -> bool {
    path.is_file()
        && path.file_name().and_then(|s| s.to_str()).is_some_and(|name| {
            let name = name
                .strip_prefix('.')
                .and_then(|n| n.strip_suffix(".partial"))
                .unwrap_or(name);
            let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
            Uuid::parse_str(stem).is_ok()
        })
}
