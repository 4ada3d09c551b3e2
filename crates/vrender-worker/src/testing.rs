//! In-process fakes for the pipeline seams.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vrender_media::{
    AssetFetcher, FailureKind, MediaError, MediaResult, ProcessCommand, RenderRunner, RunFailure, RunReport,
    TimelineCompiler,
};
use vrender_models::{AttemptRecord, Clip, Job, JobError, JobId, Timeline, WebhookPayload};
use vrender_queue::{JobRepository, MemoryJobStore, QueueError, QueueResult, RenderJob, Transition};
use vrender_storage::{ObjectStore, StorageError, StorageResult};

use crate::notifier::Notifier;
use crate::orchestrator::{AttemptOutcome, RenderOrchestrator};

/// Writes a placeholder image; fails for URLs containing "broken".
pub(crate) struct FakeFetcher;

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> MediaResult<u64> {
        if url.contains("broken") {
            return Err(MediaError::download_failed(url, "HTTP 404 Not Found"));
        }
        tokio::fs::write(dest, b"img").await?;
        Ok(3)
    }
}

pub(crate) enum Step {
    Succeed,
    /// Succeed after holding the attempt open this long
    Slow(Duration),
    Exit(&'static str),
    Timeout,
}

/// Plays back scripted results and checks the workspace is present.
pub(crate) struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    pub(crate) saw_inputs: Mutex<Vec<bool>>,
}

impl ScriptedRunner {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            saw_inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RenderRunner for ScriptedRunner {
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> RunReport {
        let work_dir = command.output_path.parent().unwrap().to_path_buf();
        self.saw_inputs.lock().unwrap().push(work_dir.join("clip_0.jpg").exists());

        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        if let Step::Slow(hold) = step {
            tokio::time::sleep(hold).await;
        }
        let failure = match step {
            Step::Succeed | Step::Slow(_) => {
                std::fs::write(&command.output_path, b"mp4").unwrap();
                None
            }
            Step::Exit(msg) => Some(RunFailure {
                kind: FailureKind::Exit,
                message: format!("FFmpeg exited with code 1: {}", msg),
                exit_code: Some(1),
                stderr_tail: Some(msg.to_string()),
            }),
            Step::Timeout => Some(RunFailure {
                kind: FailureKind::Timeout,
                message: format!("FFmpeg timeout after {}ms", timeout.as_millis()),
                exit_code: None,
                stderr_tail: None,
            }),
        };
        RunReport {
            output_path: command.output_path.clone(),
            duration_ms: Some(5),
            failure,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeStore {
    pub(crate) fail: bool,
    pub(crate) uploads: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        if self.fail {
            return Err(StorageError::upload_failed("connection reset"));
        }
        assert!(path.exists());
        assert_eq!(content_type, "video/mp4");
        self.uploads.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        Ok(format!("https://s3.local/{}?X-Amz-Expires={}", key, expires_in.as_secs()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub(crate) sent: Mutex<Vec<(String, WebhookPayload)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, payload: &WebhookPayload) {
        self.sent.lock().unwrap().push((url.to_string(), payload.clone()));
    }
}

/// Memory store whose terminal failure write can be made to error.
#[derive(Default)]
pub(crate) struct FlakyJobStore {
    inner: MemoryJobStore,
    mark_failed_errors: AtomicU32,
}

impl FlakyJobStore {
    /// Make the next `times` calls to `mark_failed` fail.
    pub(crate) fn fail_mark_failed(&self, times: u32) {
        self.mark_failed_errors.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRepository for FlakyJobStore {
    async fn create(&self, job: &Job) -> QueueResult<()> {
        self.inner.create(job).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.inner.get(id).await
    }

    async fn mark_processing(&self, id: &JobId) -> QueueResult<Transition> {
        self.inner.mark_processing(id).await
    }

    async fn increment_attempts(&self, id: &JobId) -> QueueResult<u32> {
        self.inner.increment_attempts(id).await
    }

    async fn record_attempt(&self, id: &JobId, record: &AttemptRecord) -> QueueResult<()> {
        self.inner.record_attempt(id, record).await
    }

    async fn mark_completed(&self, id: &JobId, output_url: &str) -> QueueResult<Transition> {
        self.inner.mark_completed(id, output_url).await
    }

    async fn mark_failed(&self, id: &JobId, error: &JobError) -> QueueResult<Transition> {
        let remaining = self.mark_failed_errors.load(Ordering::SeqCst);
        if remaining > 0 {
            self.mark_failed_errors.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::connection_failed("connection refused"));
        }
        self.inner.mark_failed(id, error).await
    }
}

pub(crate) struct Harness {
    pub(crate) root: tempfile::TempDir,
    pub(crate) compiler: TimelineCompiler,
    pub(crate) orchestrator: Arc<RenderOrchestrator>,
    pub(crate) jobs: Arc<FlakyJobStore>,
    pub(crate) runner: Arc<ScriptedRunner>,
    pub(crate) store: Arc<FakeStore>,
    pub(crate) notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub(crate) fn new(steps: Vec<Step>, store: FakeStore) -> Self {
        Self::with_max_attempts(steps, store, 3)
    }

    pub(crate) fn with_max_attempts(steps: Vec<Step>, store: FakeStore, max_attempts: u32) -> Self {
        let root = tempfile::tempdir().unwrap();
        let compiler = TimelineCompiler::new(root.path(), Arc::new(FakeFetcher));
        let jobs = Arc::new(FlakyJobStore::default());
        let runner = Arc::new(ScriptedRunner::new(steps));
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = RenderOrchestrator::new(
            compiler.clone(),
            runner.clone(),
            store.clone(),
            jobs.clone(),
            notifier.clone(),
        )
        .with_max_attempts(max_attempts);

        Self {
            root,
            compiler,
            orchestrator: Arc::new(orchestrator),
            jobs,
            runner,
            store,
            notifier,
        }
    }

    pub(crate) async fn submit(&self, image: &str, callback: Option<&str>) -> Job {
        let job = Job::new(
            Timeline::new(vec![
                Clip::new(image, "First", 2),
                Clip::new("https://img.example.com/b.jpg", "it's 12:30", 3),
            ]),
            callback.map(str::to_string),
        );
        self.jobs.create(&job).await.unwrap();
        job
    }

    pub(crate) fn work_dir(&self, id: &JobId) -> PathBuf {
        self.compiler.work_dir_for(id)
    }

    /// Process occurrences the way the queue would, until no retry is asked for.
    pub(crate) async fn drive(&self, job: &Job) -> Vec<AttemptOutcome> {
        let mut occurrence = RenderJob::from_job(job);
        let mut outcomes = Vec::new();
        loop {
            let outcome = self.orchestrator.process(&occurrence).await;
            assert!(!self.work_dir(&job.id).exists(), "workspace survived the attempt");
            let retry = matches!(outcome, AttemptOutcome::Retry { .. });
            outcomes.push(outcome);
            if !retry {
                return outcomes;
            }
            occurrence = occurrence.next_attempt();
        }
    }

    pub(crate) async fn stored(&self, id: &JobId) -> Job {
        self.jobs.get(id).await.unwrap().unwrap()
    }
}
