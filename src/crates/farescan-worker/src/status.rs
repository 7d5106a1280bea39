//! Client-facing job status
//!
//! Reports come from the last durably persisted checkpoint. When the store
//! cannot be read, the last good report for the job is served instead,
//! marked `stale`.

use farescan_store::{JobId, JobStatusReport, JobStore, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("status of job {job_id} unavailable: {message}")]
    Unavailable { job_id: JobId, message: String },
}

/// Read side for job status
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
    last_known: Arc<Mutex<HashMap<JobId, JobStatusReport>>>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            last_known: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusReport, StatusError> {
        match self.store.load(job_id).await {
            Ok(record) => {
                let report = JobStatusReport::from(&record);
                self.last_known.lock().insert(job_id, report.clone());
                Ok(report)
            }
            Err(StoreError::NotFound(_)) => {
                self.last_known.lock().remove(&job_id);
                Err(StatusError::NotFound(job_id))
            }
            Err(e) => {
                let cached = self.last_known.lock().get(&job_id).cloned();
                match cached {
                    Some(mut report) => {
                        warn!(job_id = %job_id, error = %e, "Serving cached status");
                        report.stale = true;
                        Ok(report)
                    }
                    None => Err(StatusError::Unavailable {
                        job_id,
                        message: e.to_string(),
                    }),
                }
            }
        }
    }
}
