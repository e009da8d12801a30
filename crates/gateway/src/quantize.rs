//! Quantization job lifecycle.
//!
//! The quantization math happens in an external converter command; we
//! only own the job records: queued → running → completed/failed, with
//! output path and error text. Jobs are in-memory (they do not survive a
//! restart).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizeStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizeJob {
    pub job_id: String,
    pub model_id: String,
    pub target_format: String,
    pub status: QuantizeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
pub struct QuantizeJobs {
    jobs: Arc<Mutex<HashMap<String, QuantizeJob>>>,
}

fn update_job<F: FnOnce(&mut QuantizeJob)>(
    jobs: &Arc<Mutex<HashMap<String, QuantizeJob>>>,
    job_id: &str,
    f: F,
) {
    if let Some(job) = jobs.lock().get_mut(job_id) {
        f(job);
    }
}

impl QuantizeJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Option<QuantizeJob> {
        self.jobs.lock().get(job_id).cloned()
    }

    pub fn list(&self) -> Vec<QuantizeJob> {
        let mut jobs: Vec<QuantizeJob> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Start a job: spawns the converter command in the background and
    /// returns the queued record immediately.
    pub fn start(
        &self,
        model_id: &str,
        target_format: &str,
        converter_command: Option<String>,
    ) -> QuantizeJob {
        let job = QuantizeJob {
            job_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            model_id: model_id.to_string(),
            target_format: target_format.to_string(),
            status: QuantizeStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            output_path: None,
            error: None,
        };
        self.jobs.lock().insert(job.job_id.clone(), job.clone());

        let jobs = self.jobs.clone();
        let job_id = job.job_id.clone();
        let model = model_id.to_string();
        let format = target_format.to_string();
        tokio::spawn(async move {
            update_job(&jobs, &job_id, |job| job.status = QuantizeStatus::Running);
            let Some(command) = converter_command else {
                update_job(&jobs, &job_id, |job| {
                    job.status = QuantizeStatus::Failed;
                    job.error = Some("no converter command configured".to_string());
                    job.completed_at = Some(Utc::now());
                });
                return;
            };

            let outcome = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("LMX_QUANTIZE_MODEL", &model)
                .env("LMX_QUANTIZE_FORMAT", &format)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await;

            match outcome {
                Ok(output) if output.status.success() => {
                    update_job(&jobs, &job_id, |job| {
                        job.status = QuantizeStatus::Completed;
                        job.output_path = Some(format!("{model}-{format}"));
                        job.completed_at = Some(Utc::now());
                    });
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    update_job(&jobs, &job_id, |job| {
                        job.status = QuantizeStatus::Failed;
                        job.error = Some(if stderr.is_empty() {
                            format!("converter exited with {}", output.status)
                        } else {
                            stderr
                        });
                        job.completed_at = Some(Utc::now());
                    });
                }
                Err(e) => {
                    update_job(&jobs, &job_id, |job| {
                        job.status = QuantizeStatus::Failed;
                        job.error = Some(e.to_string());
                        job.completed_at = Some(Utc::now());
                    });
                }
            }
        });

        job
    }
}
