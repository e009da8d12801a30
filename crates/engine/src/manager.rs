//! Model manager — download, inventory, and delete models against the
//! on-disk cache.
//!
//! Downloads come from a HuggingFace-compatible hub: the repo file tree is
//! listed first (which also yields the size estimate), then each file is
//! streamed to disk while a [`DownloadTask`] tracks byte/file progress.
//! A completion hook lets the engine chain an auto-load when the task
//! reaches `completed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lmx_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Download task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub download_id: String,
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub progress_percent: f64,
    pub total_files: usize,
    pub completed_files: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hook invoked when a download reaches a terminal state.
pub type DownloadCompletionHook = Box<dyn FnOnce(DownloadStatus) + Send + 'static>;

// ── Hub wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type", default)]
    entry_type: String,
}

/// Apply allow/ignore glob lists to a repo file listing.
fn filter_files(files: &[TreeEntry], allow: &[String], ignore: &[String]) -> Vec<TreeEntry> {
    let allow_patterns: Vec<glob::Pattern> = allow
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    let ignore_patterns: Vec<glob::Pattern> = ignore
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    files
        .iter()
        .filter(|f| f.entry_type != "directory")
        .filter(|f| {
            if !allow_patterns.is_empty() && !allow_patterns.iter().any(|p| p.matches(&f.path)) {
                return false;
            }
            !ignore_patterns.iter().any(|p| p.matches(&f.path))
        })
        .cloned()
        .collect()
}

/// Repo IDs contain `/`; map them to a filesystem-safe directory name.
fn repo_dir_name(repo_id: &str) -> String {
    repo_id.replace('/', "--")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local inventory entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct LocalModel {
    pub model_id: String,
    pub size_bytes: u64,
    pub file_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ModelManager {
    models_directory: PathBuf,
    hub_base_url: String,
    hub_token: Option<String>,
    http: reqwest::Client,
    downloads: Arc<Mutex<HashMap<String, DownloadTask>>>,
}

impl ModelManager {
    pub fn new(
        models_directory: PathBuf,
        hub_base_url: String,
        hub_token: Option<String>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&models_directory)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("hub http client: {e}")))?;
        Ok(Self {
            models_directory,
            hub_base_url,
            hub_token,
            http,
            downloads: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn models_directory(&self) -> &Path {
        &self.models_directory
    }

    fn model_path(&self, model_id: &str) -> PathBuf {
        self.models_directory.join(repo_dir_name(model_id))
    }

    /// Whether the model exists in the cache (or is a local path).
    pub fn is_available(&self, model_id: &str) -> bool {
        let as_path = Path::new(model_id);
        if as_path.is_absolute() && as_path.exists() {
            return true;
        }
        let cached = self.model_path(model_id);
        cached.is_dir()
            && std::fs::read_dir(&cached)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
    }

    /// All cached models with their on-disk footprint.
    pub fn list(&self) -> Result<Vec<LocalModel>> {
        let mut models = Vec::new();
        for entry in std::fs::read_dir(&self.models_directory)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().replace("--", "/");
            let (size_bytes, file_count) = dir_stats(&entry.path());
            models.push(LocalModel {
                model_id: name,
                size_bytes,
                file_count,
            });
        }
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Delete a cached model. The caller is responsible for refusing
    /// deletion while the model is loaded.
    pub fn delete(&self, model_id: &str) -> Result<()> {
        let path = self.model_path(model_id);
        if !path.is_dir() {
            return Err(Error::ModelNotFound(model_id.to_string()));
        }
        std::fs::remove_dir_all(&path)?;
        tracing::info!(model_id, "model deleted from cache");
        Ok(())
    }

    pub fn get_download(&self, download_id: &str) -> Option<DownloadTask> {
        self.downloads.lock().get(download_id).cloned()
    }

    pub fn list_downloads(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.downloads.lock().values().cloned().collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        tasks
    }

    /// Best-effort size estimate from the hub file listing (0 if the hub
    /// is unreachable).
    pub async fn estimate_size(&self, repo_id: &str, revision: Option<&str>) -> u64 {
        match self.list_repo_files(repo_id, revision).await {
            Ok(files) => files.iter().map(|f| f.size).sum(),
            Err(e) => {
                tracing::warn!(repo_id, error = %e, "size estimate failed");
                0
            }
        }
    }

    async fn list_repo_files(
        &self,
        repo_id: &str,
        revision: Option<&str>,
    ) -> Result<Vec<TreeEntry>> {
        let revision = revision.unwrap_or("main");
        let url = format!(
            "{}/api/models/{repo_id}/tree/{revision}?recursive=true",
            self.hub_base_url.trim_end_matches('/')
        );
        let mut request = self.http.get(&url);
        if let Some(token) = &self.hub_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("hub listing: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ModelNotFound(format!(
                "{repo_id} (hub returned {})",
                response.status()
            )));
        }
        response
            .json::<Vec<TreeEntry>>()
            .await
            .map_err(|e| Error::Internal(format!("hub listing parse: {e}")))
    }

    /// Start an async background download. Returns the task snapshot; the
    /// worker updates the shared map as bytes arrive. `on_complete` fires
    /// once, with the terminal status.
    pub async fn start_download(
        &self,
        repo_id: &str,
        revision: Option<String>,
        allow_patterns: Vec<String>,
        ignore_patterns: Vec<String>,
        on_complete: Option<DownloadCompletionHook>,
    ) -> Result<DownloadTask> {
        let download_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let estimated = self.estimate_size(repo_id, revision.as_deref()).await;

        let task = DownloadTask {
            download_id: download_id.clone(),
            repo_id: repo_id.to_string(),
            revision: revision.clone(),
            status: DownloadStatus::Downloading,
            downloaded_bytes: 0,
            total_bytes: estimated,
            progress_percent: 0.0,
            total_files: 0,
            completed_files: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.downloads.lock().insert(download_id.clone(), task.clone());

        let worker = DownloadWorker {
            downloads: self.downloads.clone(),
            http: self.http.clone(),
            hub_base_url: self.hub_base_url.clone(),
            hub_token: self.hub_token.clone(),
            target_dir: self.model_path(repo_id),
        };
        let repo = repo_id.to_string();
        let id = download_id.clone();
        tokio::spawn(async move {
            let status = match worker
                .run(&id, &repo, revision.as_deref(), &allow_patterns, &ignore_patterns)
                .await
            {
                Ok(()) => DownloadStatus::Completed,
                Err(e) => {
                    worker.mark_failed(&id, &e.to_string());
                    DownloadStatus::Failed
                }
            };
            if let Some(hook) = on_complete {
                hook(status);
            }
        });

        tracing::info!(
            download_id = %download_id,
            repo_id,
            estimated_bytes = estimated,
            "download started"
        );
        Ok(task)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Download worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct DownloadWorker {
    downloads: Arc<Mutex<HashMap<String, DownloadTask>>>,
    http: reqwest::Client,
    hub_base_url: String,
    hub_token: Option<String>,
    target_dir: PathBuf,
}

impl DownloadWorker {
    fn update<F: FnOnce(&mut DownloadTask)>(&self, id: &str, f: F) {
        if let Some(task) = self.downloads.lock().get_mut(id) {
            f(task);
        }
    }

    fn mark_failed(&self, id: &str, error: &str) {
        self.update(id, |task| {
            task.status = DownloadStatus::Failed;
            task.error = Some(error.to_string());
            task.completed_at = Some(Utc::now());
        });
        tracing::warn!(download_id = id, error, "download failed");
    }

    async fn run(
        &self,
        id: &str,
        repo_id: &str,
        revision: Option<&str>,
        allow: &[String],
        ignore: &[String],
    ) -> Result<()> {
        let revision = revision.unwrap_or("main");
        let listing_url = format!(
            "{}/api/models/{repo_id}/tree/{revision}?recursive=true",
            self.hub_base_url.trim_end_matches('/')
        );
        let mut request = self.http.get(&listing_url);
        if let Some(token) = &self.hub_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("hub listing: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ModelNotFound(format!(
                "{repo_id} (hub returned {})",
                response.status()
            )));
        }
        let all_files: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("hub listing parse: {e}")))?;
        let files = filter_files(&all_files, allow, ignore);
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();

        self.update(id, |task| {
            task.total_files = files.len();
            task.total_bytes = total_bytes;
        });

        std::fs::create_dir_all(&self.target_dir)?;
        for file in &files {
            self.fetch_file(id, repo_id, revision, &file.path).await?;
            self.update(id, |task| task.completed_files += 1);
        }

        self.update(id, |task| {
            task.status = DownloadStatus::Completed;
            task.progress_percent = 100.0;
            task.completed_at = Some(Utc::now());
        });
        tracing::info!(download_id = id, repo_id, files = files.len(), "download completed");
        Ok(())
    }

    async fn fetch_file(&self, id: &str, repo_id: &str, revision: &str, path: &str) -> Result<()> {
        let url = format!(
            "{}/{repo_id}/resolve/{revision}/{path}",
            self.hub_base_url.trim_end_matches('/')
        );
        let mut request = self.http.get(&url);
        if let Some(token) = &self.hub_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("download {path}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "download {path}: HTTP {}",
                response.status()
            )));
        }

        let target = self.target_dir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(Error::Io)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Internal(format!("download {path}: {e}")))?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(Error::Io)?;
            let len = chunk.len() as u64;
            self.update(id, |task| {
                task.downloaded_bytes += len;
                if task.total_bytes > 0 {
                    task.progress_percent = (task.downloaded_bytes as f64
                        / task.total_bytes as f64
                        * 100.0)
                        .min(100.0);
                }
            });
        }
        Ok(())
    }
}

fn dir_stats(path: &Path) -> (u64, usize) {
    let mut size = 0u64;
    let mut count = 0usize;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                stack.push(entry_path);
            } else if let Ok(meta) = entry.metadata() {
                size += meta.len();
                count += 1;
            }
        }
    }
    (size, count)
}
