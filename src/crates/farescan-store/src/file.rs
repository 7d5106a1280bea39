//! File-backed durable job store
//!
//! Layout, one directory per job under the store root:
//!
//! ```text
//! <root>/<job_id>/job.json          job record (status, parameters, totals)
//! <root>/<job_id>/checkpoint.<ext>  checkpoint in the configured encoding
//! <root>/<job_id>/lease.json        current lease, absent when released
//! <root>/<job_id>/results.jsonl     one FlightResult per line
//! ```
//!
//! Whole-file records are replaced with write-to-temp, fsync, rename, so a
//! crash leaves either the old or the new version on disk. Mutations are
//! serialized by one in-process lock; the store assumes a single process per
//! root directory.

use crate::{
    checkpoint::Checkpoint,
    error::{Result, StoreError},
    job::{Job, JobId, JobStatus},
    lease::{Lease, LeaseOutcome},
    params::SearchParameters,
    record::JobRecord,
    result::FlightResult,
    serializer::{BincodeSerializer, SerializerProtocol},
    traits::JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const JOB_FILE: &str = "job.json";
const LEASE_FILE: &str = "lease.json";
const RESULTS_FILE: &str = "results.jsonl";

/// Durable job store on the local filesystem
#[derive(Debug, Clone)]
pub struct FileJobStore<S: SerializerProtocol = BincodeSerializer> {
    root: PathBuf,
    serializer: S,
    /// Held across every read-modify-write; caches result indices of
    /// unfinished jobs
    writes: Arc<Mutex<HashMap<JobId, HashSet<u64>>>>,
}

impl FileJobStore<BincodeSerializer> {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_serializer(root, BincodeSerializer).await
    }
}

impl<S: SerializerProtocol> FileJobStore<S> {
    pub async fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file job store");
        Ok(Self {
            root,
            serializer,
            writes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn checkpoint_path(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("checkpoint.{}", self.serializer.extension()))
    }

    async fn read_job(&self, job_id: JobId) -> Result<Job> {
        match fs::read(self.job_dir(job_id).join(JOB_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, job_id: JobId) -> Result<JobRecord> {
        let mut job = self.read_job(job_id).await?;

        let checkpoint: Checkpoint = match fs::read(self.checkpoint_path(job_id)).await {
            Ok(bytes) => self.serializer.loads(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Invalid(format!(
                    "job {} has no checkpoint file",
                    job_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let lease: Option<Lease> = match fs::read(self.job_dir(job_id).join(LEASE_FILE)).await {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // The checkpoint file is the only record rewritten on progress.
        job.processed_combinations = checkpoint.processed_index;
        job.updated_at = job.updated_at.max(checkpoint.last_checkpoint_at);

        Ok(JobRecord {
            job,
            checkpoint,
            lease,
        })
    }

    async fn write_job(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.job_dir(job.job_id).join(JOB_FILE), &bytes).await
    }

    async fn write_checkpoint(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = self.serializer.dumps(checkpoint)?;
        write_atomic(&self.checkpoint_path(job_id), &bytes).await
    }

    async fn write_lease(&self, job_id: JobId, lease: Option<&Lease>) -> Result<()> {
        let path = self.job_dir(job_id).join(LEASE_FILE);
        match lease {
            Some(lease) => write_atomic(&path, &serde_json::to_vec_pretty(lease)?).await,
            None => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn read_results(&self, job_id: JobId) -> Result<BTreeMap<u64, FlightResult>> {
        let path = self.job_dir(job_id).join(RESULTS_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut results = BTreeMap::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FlightResult>(line) {
                Ok(result) => {
                    results.entry(result.combination_index).or_insert(result);
                }
                Err(e) => {
                    // A torn final line is what a crash mid-append leaves behind.
                    warn!(
                        job_id = %job_id,
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable result line"
                    );
                }
            }
        }
        Ok(results)
    }

    /// Cut a partial final line left by a crash mid-append.
    async fn truncate_torn_result(&self, job_id: JobId) -> Result<()> {
        let path = self.job_dir(job_id).join(RESULTS_FILE);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if content.last().map_or(true, |&b| b == b'\n') {
            return Ok(());
        }

        let keep = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        warn!(
            job_id = %job_id,
            dropped_bytes = content.len() - keep,
            "Truncating torn result line"
        );
        let file = fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(keep as u64).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn append_line(&self, job_id: JobId, line: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.job_dir(job_id).join(RESULTS_FILE))
            .await?;
        file.write_all(line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn list_job_ids(&self) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<JobId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl<S: SerializerProtocol + 'static> JobStore for FileJobStore<S> {
    async fn create_job(&self, parameters: SearchParameters) -> Result<Job> {
        parameters.validate()?;
        let job = Job::new(parameters);

        let _guard = self.writes.lock().await;
        fs::create_dir_all(self.job_dir(job.job_id)).await?;
        // Checkpoint first: a job file without a checkpoint is never listed as ready.
        self.write_checkpoint(job.job_id, &Checkpoint::initial()).await?;
        self.write_job(&job).await?;

        debug!(job_id = %job.job_id, total = job.total_combinations, "Created job");
        Ok(job)
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord> {
        self.read_record(job_id).await
    }

    async fn save_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64> {
        let _guard = self.writes.lock().await;
        let mut record = self.read_record(job_id).await?;
        let version = record.apply_checkpoint(checkpoint, expected_version)?;
        self.write_checkpoint(job_id, &record.checkpoint).await?;
        Ok(version)
    }

    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let mut writes = self.writes.lock().await;
        let mut record = self.read_record(job_id).await?;
        if record.apply_status(status, reason)? {
            self.write_job(&record.job).await?;
        }
        if status.is_terminal() {
            writes.remove(&job_id);
        }
        Ok(())
    }

    async fn append_result(&self, result: FlightResult) -> Result<bool> {
        let job_id = result.job_id;
        let mut writes = self.writes.lock().await;
        self.read_job(job_id).await?;

        if !writes.contains_key(&job_id) {
            self.truncate_torn_result(job_id).await?;
            let existing = self.read_results(job_id).await?;
            writes.insert(job_id, existing.into_keys().collect());
        }
        let indices = writes.entry(job_id).or_default();
        if indices.contains(&result.combination_index) {
            return Ok(false);
        }

        let mut line = serde_json::to_vec(&result)?;
        line.push(b'\n');
        let index = result.combination_index;
        match self.append_line(job_id, &line).await {
            Ok(()) => {
                indices.insert(index);
                Ok(true)
            }
            Err(e) => {
                // The tail may be torn now; repair it on the next append.
                writes.remove(&job_id);
                Err(e)
            }
        }
    }

    async fn results(&self, job_id: JobId) -> Result<Vec<FlightResult>> {
        self.read_job(job_id).await?;
        Ok(self.read_results(job_id).await?.into_values().collect())
    }

    async fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<LeaseOutcome> {
        let _guard = self.writes.lock().await;
        let mut record = self.read_record(job_id).await?;
        let outcome = record.grant_lease(owner, ttl, Utc::now())?;
        if let LeaseOutcome::Acquired(lease) = &outcome {
            self.write_lease(job_id, Some(lease)).await?;
        }
        Ok(outcome)
    }

    async fn renew_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<Lease> {
        let _guard = self.writes.lock().await;
        let mut record = self.read_record(job_id).await?;
        let lease = record.extend_lease(owner, ttl, Utc::now())?;
        self.write_lease(job_id, Some(&lease)).await?;
        Ok(lease)
    }

    async fn release_lease(&self, job_id: JobId, owner: &str) -> Result<()> {
        let _guard = self.writes.lock().await;
        let mut record = self.read_record(job_id).await?;
        record.release_lease(owner)?;
        self.write_lease(job_id, record.lease.as_ref()).await
    }

    async fn pending_jobs(&self) -> Result<Vec<JobId>> {
        let mut pending = Vec::new();
        for job_id in self.list_job_ids().await? {
            let job = match self.read_job(job_id).await {
                Ok(job) => job,
                // Directory created, job file not yet written.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if job.status == JobStatus::Pending {
                pending.push((job.created_at, job_id));
            }
        }
        pending.sort();
        Ok(pending.into_iter().map(|(_, id)| id).collect())
    }

    async fn orphaned_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut orphaned = Vec::new();
        for job_id in self.list_job_ids().await? {
            match self.read_record(job_id).await {
                Ok(record) if record.is_orphaned(now) => orphaned.push(job_id),
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(orphaned)
    }
}
