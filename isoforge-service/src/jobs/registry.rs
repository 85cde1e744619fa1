// Job Registry
// Accepts build requests, runs each as a background task and tracks its status

use super::models::{Job, JobStatus, JobSummary};
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{progress_channel, BuildPipeline, BuildRequest, PipelineSettings};
use crate::runners::CommandRunner;
use crate::workspace::Workspace;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A registered job: its status record plus what is needed to find its artifact
struct JobEntry {
    record: RwLock<Job>,
    workspace: Workspace,
    destination: String,
    /// The workspace belongs to this job alone, so its scratch tree can go
    /// once the job is terminal
    isolated: bool,
}

/// In-memory registry of build jobs.
///
/// Cloning is cheap and every clone sees the same jobs.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Arc<JobEntry>>>>,
    runner: Arc<dyn CommandRunner>,
    config: Arc<ServiceConfig>,
}

impl JobRegistry {
    pub fn new(config: ServiceConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            runner,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate the request, prepare its workspace and start the build in the
    /// background. Returns the new job id without waiting for the build.
    pub async fn submit(&self, request: BuildRequest) -> ServiceResult<String> {
        request.validate()?;

        let id = new_job_id();
        let workspace = Workspace::for_job(&self.config.workspace, &id);
        let skeleton = workspace.clone();
        tokio::task::spawn_blocking(move || skeleton.create())
            .await
            .map_err(|e| ServiceError::Workspace {
                path: workspace.root().to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })??;

        let entry = Arc::new(JobEntry {
            record: RwLock::new(Job::new(id.clone())),
            workspace: workspace.clone(),
            destination: request.destination.clone(),
            isolated: self.config.workspace.isolate_jobs,
        });
        self.jobs.write().await.insert(id.clone(), entry.clone());

        tracing::info!(job = %id, root = %workspace.root().display(), "build accepted");

        let pipeline = BuildPipeline::new(self.runner.clone(), workspace)
            .with_settings(PipelineSettings::from_config(&self.config));
        tokio::spawn(run_job(entry, pipeline, request));

        Ok(id)
    }

    /// Snapshot of a job's status record
    pub async fn status(&self, id: &str) -> ServiceResult<Job> {
        let entry = self.entry(id).await?;
        let job = entry.record.read().await;
        Ok(job.clone())
    }

    pub async fn logs(&self, id: &str) -> ServiceResult<Vec<String>> {
        let entry = self.entry(id).await?;
        let job = entry.record.read().await;
        Ok(job.logs.clone())
    }

    /// Recorded artifact path of a completed job
    pub async fn output(&self, id: &str) -> ServiceResult<PathBuf> {
        let entry = self.entry(id).await?;
        let job = entry.record.read().await;
        match (&job.status, &job.output) {
            (JobStatus::Completed, Some(output)) => Ok(output.clone()),
            _ => Err(ServiceError::NotReady {
                id: id.to_string(),
                status: job.status.to_string(),
            }),
        }
    }

    /// Like [`output`](Self::output), but the returned path is known to exist
    pub async fn artifact(&self, id: &str) -> ServiceResult<PathBuf> {
        let recorded = self.output(id).await?;
        if recorded.is_file() {
            return Ok(recorded);
        }

        let entry = self.entry(id).await?;
        let resolved = entry.workspace.resolve_artifact(&entry.destination);
        if resolved.is_file() {
            return Ok(resolved);
        }

        Err(ServiceError::ArtifactMissing {
            id: id.to_string(),
            path: recorded,
        })
    }

    /// Summaries of every job, oldest first
    pub async fn list(&self) -> Vec<JobSummary> {
        let entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(entry.record.read().await.summary());
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    async fn entry(&self, id: &str) -> ServiceResult<Arc<JobEntry>> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }
}

/// Drive one build: run the pipeline in its own task, fold its events into
/// the job record in order, drop the scratch tree of an isolated job, then
/// record the outcome
async fn run_job(entry: Arc<JobEntry>, pipeline: BuildPipeline, request: BuildRequest) {
    let (tx, mut rx) = progress_channel();
    let pipeline = pipeline.with_progress(tx);
    let handle = tokio::spawn(async move { pipeline.execute(&request).await });

    while let Some(event) = rx.recv().await {
        entry.record.write().await.apply(&event);
    }

    let id = entry.record.read().await.id.clone();
    let outcome = handle.await;

    if entry.isolated {
        remove_scratch(&id, &entry.workspace).await;
    }

    match outcome {
        Ok(Ok(_)) => {
            let output = entry.workspace.resolve_artifact(&entry.destination);
            tracing::info!(job = %id, output = %output.display(), "build completed");
            entry.record.write().await.complete(output);
        }
        Ok(Err(err)) => {
            tracing::error!(job = %id, error = %err, "build failed");
            entry.record.write().await.fail(err.to_string());
        }
        Err(join_err) => {
            tracing::error!(job = %id, error = %join_err, "build task aborted");
            entry
                .record
                .write()
                .await
                .fail(format!("build task aborted: {}", join_err));
        }
    }
}

async fn remove_scratch(id: &str, workspace: &Workspace) {
    let workspace = workspace.clone();
    match tokio::task::spawn_blocking(move || workspace.remove_scratch()).await {
        Ok(Ok(())) => tracing::debug!(job = %id, "build tree removed"),
        Ok(Err(e)) => tracing::warn!(job = %id, error = %e, "failed to remove build tree"),
        Err(e) => tracing::warn!(job = %id, error = %e, "build tree cleanup aborted"),
    }
}

fn new_job_id() -> String {
    format!("build_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::StepState;
    use crate::pipeline::StageName;
    use crate::runners::scripted::{fail, ok, ScriptedRunner};
    use std::collections::HashSet;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const USER_DATA: &str = "#cloud-config\nautoinstall:\n  version: 1\n";

    fn config(dir: &TempDir) -> ServiceConfig {
        let mut config = ServiceConfig::default().with_workspace_root(dir.path().join("base"));
        config.commands.retry_delay_secs = 0;
        config
    }

    /// Runner that fakes extraction and packaging on disk
    fn image_tools() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("7z", |inv| {
                let out = inv.args.last().unwrap().trim_start_matches("-o").to_string();
                fs::create_dir_all(format!("{}/boot/grub", out)).unwrap();
                fs::write(format!("{}/boot/grub/grub.cfg", out), "linux /casper/vmlinuz ---\n")
                    .unwrap();
                ok("")
            })
            .on("xorriso", |inv| {
                // the image carries the job's own user-data
                let build_dir = inv.current_dir.clone().unwrap();
                let user_data = fs::read(build_dir.join("user-data")).unwrap();
                let index = inv.args.iter().position(|arg| arg == "-o").unwrap();
                fs::write(&inv.args[index + 1], user_data).unwrap();
                ok("")
            })
    }

    fn local_image(dir: &TempDir) -> PathBuf {
        let image = dir.path().join("ubuntu-24.04.1-live-server-amd64.iso");
        fs::write(&image, "image").unwrap();
        image
    }

    async fn wait_until_done(registry: &JobRegistry, id: &str) -> Job {
        for _ in 0..500 {
            let job = registry.status(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(config(&dir), Arc::new(ScriptedRunner::new()));

        assert!(matches!(
            registry.status("build_missing").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            registry.logs("build_missing").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            registry.output("build_missing").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            registry.artifact("build_missing").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_job() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(config(&dir), Arc::new(ScriptedRunner::new()));

        let request = BuildRequest::local(local_image(&dir), "out.img").with_user_data(USER_DATA);
        assert!(matches!(
            registry.submit(request).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_job() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(config(&dir), Arc::new(image_tools()));

        let request = BuildRequest::local(local_image(&dir), "custom.iso").with_user_data(USER_DATA);
        let id = registry.submit(request).await.unwrap();
        assert!(id.starts_with("build_"));

        let job = wait_until_done(&registry, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.error.is_none());
        assert_eq!(job.steps[&StageName::Repackage], StepState::Completed);
        assert!(!job.steps.contains_key(&StageName::Download));

        let job_root = dir.path().join("base/jobs").join(&id);
        let expected = job_root.join("output/custom.iso");
        assert_eq!(job.output.as_deref(), Some(expected.as_path()));
        assert_eq!(registry.output(&id).await.unwrap(), expected);
        assert_eq!(registry.artifact(&id).await.unwrap(), expected);
        assert_eq!(fs::read_to_string(&expected).unwrap(), USER_DATA);

        // scratch tree is gone, the shared cache stays
        assert!(!job_root.join("build").exists());
        assert!(!job_root.join("BOOT").exists());
        assert!(dir.path().join("base/download").is_dir());

        let logs = registry.logs(&id).await.unwrap();
        assert_eq!(logs.first().map(String::as_str), Some("Preparing build environment..."));
        assert!(logs.last().unwrap().starts_with("Build completed successfully"));

        fs::remove_file(&expected).unwrap();
        assert!(matches!(
            registry.artifact(&id).await,
            Err(ServiceError::ArtifactMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_job_keeps_error_and_stderr() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("7z", |inv| fail(inv, "Headers Error"));
        let registry = JobRegistry::new(config(&dir), Arc::new(runner));

        let request = BuildRequest::local(local_image(&dir), "out.iso").with_user_data(USER_DATA);
        let id = registry.submit(request).await.unwrap();

        let job = wait_until_done(&registry, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output.is_none());
        assert!(job.progress < 100);
        assert!(job.error.as_deref().unwrap().starts_with("extract stage failed"));
        assert_eq!(job.steps[&StageName::Extract], StepState::Running);
        assert!(!job.steps.contains_key(&StageName::Inject));
        assert!(job.logs.contains(&"ERROR: Headers Error".to_string()));
        assert!(!dir.path().join("base/jobs").join(&id).join("build").exists());

        assert!(matches!(
            registry.output(&id).await,
            Err(ServiceError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_destination_jobs_keep_their_own_image() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(config(&dir), Arc::new(image_tools()));
        let image = local_image(&dir);

        let first_data = "#cloud-config\nautoinstall: {a: 1}\n";
        let second_data = "#cloud-config\nautoinstall: {b: 2}\n";
        let first = registry
            .submit(BuildRequest::local(&image, "out.iso").with_user_data(first_data))
            .await
            .unwrap();
        let second = registry
            .submit(BuildRequest::local(&image, "out.iso").with_user_data(second_data))
            .await
            .unwrap();

        let first_job = wait_until_done(&registry, &first).await;
        let second_job = wait_until_done(&registry, &second).await;
        assert_eq!(first_job.status, JobStatus::Completed);
        assert_eq!(second_job.status, JobStatus::Completed);
        assert_ne!(first_job.output, second_job.output);

        let first_artifact = registry.artifact(&first).await.unwrap();
        let second_artifact = registry.artifact(&second).await.unwrap();
        assert_eq!(fs::read_to_string(first_artifact).unwrap(), first_data);
        assert_eq!(fs::read_to_string(second_artifact).unwrap(), second_data);
    }

    #[tokio::test]
    async fn test_shared_workspace_keeps_build_tree() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.workspace.isolate_jobs = false;
        let registry = JobRegistry::new(config, Arc::new(image_tools()));

        let request = BuildRequest::local(local_image(&dir), "out.iso").with_user_data(USER_DATA);
        let id = registry.submit(request).await.unwrap();
        let job = wait_until_done(&registry, &id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.output.as_deref(),
            Some(dir.path().join("base/download/out.iso").as_path())
        );
        assert!(dir.path().join("base/build/user-data").is_file());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_unique_ids() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(config(&dir), Arc::new(image_tools()));
        let image = local_image(&dir);

        let mut handles = Vec::new();
        for n in 0..8 {
            let registry = registry.clone();
            let request = BuildRequest::local(&image, format!("out-{}.iso", n)).with_user_data(USER_DATA);
            handles.push(tokio::spawn(async move { registry.submit(request).await }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 8);

        for id in &ids {
            let job = wait_until_done(&registry, id).await;
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(registry.list().await.len(), 8);
    }
}
