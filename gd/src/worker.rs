//! Deploy worker - the single consumer of push notifications
//!
//! The webhook listener hands every decoded notification to a [`DeployHandle`].
//! One [`DeployWorker`] task drains the queue and handles each notification to
//! completion, post-deploy command included, before receiving the next.
//!
//! That ordering is the whole concurrency contract: two releases never overlap,
//! so two pulls or two copies never race on `working/`. Do not spawn a second
//! worker for the same target.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hook::PostDeployCommand;
use crate::notification::{FilterDecision, PushNotification, evaluate};
use crate::release::{ReleaseManager, ReleasePath};

/// Errors from talking to the worker
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Deploy worker has stopped")]
    Closed,
}

/// Commands sent to the worker
#[derive(Debug)]
pub enum DeployCommand {
    Notify(PushNotification),
    Shutdown,
}

/// What happened to a notification
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// Filtered out; nothing on disk was touched
    Skipped { git_ref: String, reason: String },
    /// A release went live
    Released { release: ReleasePath },
    /// The release was aborted; `current` is unchanged
    ReleaseFailed { commit: String, error: String },
    /// The post-deploy command succeeded
    HookFinished { release: String },
    /// The post-deploy command failed; the release stays live
    HookFailed { release: String, error: String },
}

/// Handle to queue notifications for the worker
#[derive(Clone)]
pub struct DeployHandle {
    tx: mpsc::UnboundedSender<DeployCommand>,
    event_tx: broadcast::Sender<DeployEvent>,
}

impl DeployHandle {
    /// Queue a notification; returns immediately
    pub fn submit(&self, notification: PushNotification) -> Result<(), WorkerError> {
        debug!(git_ref = %notification.git_ref, "DeployHandle::submit: called");
        self.tx
            .send(DeployCommand::Notify(notification))
            .map_err(|_| WorkerError::Closed)
    }

    /// Ask the worker to stop after the notification it is handling
    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.tx.send(DeployCommand::Shutdown).map_err(|_| WorkerError::Closed)
    }

    /// Subscribe to outcomes of notifications submitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.event_tx.subscribe()
    }
}

/// The queue consumer
pub struct DeployWorker {
    manager: ReleaseManager,
    hook: Option<PostDeployCommand>,
    rx: mpsc::UnboundedReceiver<DeployCommand>,
    event_tx: broadcast::Sender<DeployEvent>,
}

impl DeployWorker {
    /// Spawn the worker task
    pub fn spawn(manager: ReleaseManager, hook: Option<PostDeployCommand>) -> (DeployHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);

        let worker = Self {
            manager,
            hook,
            rx,
            event_tx: event_tx.clone(),
        };
        let task = tokio::spawn(worker.run());
        info!("Deploy worker spawned");

        (DeployHandle { tx, event_tx }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                DeployCommand::Notify(notification) => self.handle(notification).await,
                DeployCommand::Shutdown => {
                    debug!("DeployWorker::run: shutdown requested");
                    break;
                }
            }
        }
        info!("Deploy worker stopped");
    }

    async fn handle(&self, notification: PushNotification) {
        info!(
            git_ref = %notification.git_ref,
            repository = %notification.repository.name,
            commit = %notification.head_commit_id(),
            "Received push notification"
        );

        let commit = match evaluate(self.manager.target(), &notification) {
            FilterDecision::Accept { commit } => commit,
            decision => {
                info!(reason = %decision, "Deploy skipped: {}", notification.git_ref);
                self.emit(DeployEvent::Skipped {
                    git_ref: notification.git_ref,
                    reason: decision.to_string(),
                });
                return;
            }
        };

        let release = match self.manager.release(&commit).await {
            Ok(release) => release,
            Err(e) => {
                error!(%commit, error = %e, "Release failed");
                self.emit(DeployEvent::ReleaseFailed {
                    commit,
                    error: e.to_string(),
                });
                return;
            }
        };
        self.emit(DeployEvent::Released {
            release: release.clone(),
        });

        if let Some(hook) = &self.hook {
            match hook.run(&release, self.manager.target()).await {
                Ok(out) => {
                    let out = out.trim();
                    if !out.is_empty() {
                        info!("{}", out);
                    }
                    self.emit(DeployEvent::HookFinished { release: release.name });
                }
                Err(e) => {
                    warn!(command = %hook.display(), error = %e, "Failed to run post-deploy command");
                    self.emit(DeployEvent::HookFailed {
                        release: release.name,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn emit(&self, event: DeployEvent) {
        // No subscribers is the normal case outside tests
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CLONE_URL, DeployTarget};
    use crate::git::fake::FakeVcs;
    use crate::git::{GitError, Vcs};
    use crate::prepare::prepare;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn next_event(rx: &mut broadcast::Receiver<DeployEvent>) -> DeployEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for deploy event")
            .expect("event channel closed")
    }

    async fn prepared(temp: &TempDir, vcs: Arc<dyn Vcs>) -> ReleaseManager {
        let target = DeployTarget::new("acme/site", "master", temp.path().join("site")).unwrap();
        prepare(&target, vcs.as_ref(), DEFAULT_CLONE_URL).await.unwrap();
        ReleaseManager::new(target, vcs)
    }

    fn listing(root: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap().path().to_path_buf())
            .collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_matching_notification_releases_and_runs_hook() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::with_files(&[("index.html", "v1")]));
        let manager = prepared(&temp, vcs.clone()).await;
        let hook = PostDeployCommand::parse("touch deployed.marker");

        let (handle, task) = DeployWorker::spawn(manager, hook);
        let mut events = handle.subscribe();
        handle
            .submit(PushNotification::new("refs/heads/master", "acme", "site", "abc123"))
            .unwrap();

        let release = match next_event(&mut events).await {
            DeployEvent::Released { release } => release,
            other => panic!("Expected Released, got {:?}", other),
        };
        assert!(release.name.ends_with(".abc123"));
        assert!(matches!(next_event(&mut events).await, DeployEvent::HookFinished { .. }));
        assert!(release.path.join("deployed.marker").exists());

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_matching_ref_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::with_files(&[("index.html", "v1")]));
        let manager = prepared(&temp, vcs.clone()).await;
        let root = temp.path().join("site");
        let before = listing(&root);
        let calls_before = vcs.calls().len();

        let (handle, task) = DeployWorker::spawn(manager, PostDeployCommand::parse("touch should-not-run"));
        let mut events = handle.subscribe();
        handle
            .submit(PushNotification::new("refs/heads/develop", "acme", "site", "abc123"))
            .unwrap();

        match next_event(&mut events).await {
            DeployEvent::Skipped { git_ref, .. } => assert_eq!(git_ref, "refs/heads/develop"),
            other => panic!("Expected Skipped, got {:?}", other),
        }
        assert_eq!(listing(&root), before);
        assert_eq!(vcs.calls().len(), calls_before);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_release_skips_hook_and_keeps_running() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::with_files(&[("index.html", "v1")]));
        let manager = prepared(&temp, vcs.clone()).await;

        let (handle, task) = DeployWorker::spawn(manager, PostDeployCommand::parse("touch marker"));
        let mut events = handle.subscribe();

        vcs.fail_pull(true);
        handle
            .submit(PushNotification::new("refs/heads/master", "acme", "site", "bad"))
            .unwrap();
        assert!(matches!(next_event(&mut events).await, DeployEvent::ReleaseFailed { .. }));

        vcs.fail_pull(false);
        handle
            .submit(PushNotification::new("refs/heads/master", "acme", "site", "good"))
            .unwrap();
        assert!(matches!(next_event(&mut events).await, DeployEvent::Released { .. }));

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hook_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::with_files(&[("index.html", "v1")]));
        let manager = prepared(&temp, vcs).await;

        let (handle, task) = DeployWorker::spawn(manager, PostDeployCommand::parse("false"));
        let mut events = handle.subscribe();
        handle
            .submit(PushNotification::new("refs/heads/master", "acme", "site", "abc"))
            .unwrap();

        assert!(matches!(next_event(&mut events).await, DeployEvent::Released { .. }));
        assert!(matches!(next_event(&mut events).await, DeployEvent::HookFailed { .. }));

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    /// Pull that takes a while and records how many pulls overlap
    #[derive(Default)]
    struct SlowVcs {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        inner: FakeVcs,
    }

    #[async_trait]
    impl Vcs for SlowVcs {
        async fn clone_repo(&self, url: &str, parent: &Path, dest: &str) -> Result<String, GitError> {
            self.inner.clone_repo(url, parent, dest).await
        }

        async fn checkout(&self, checkout: &Path, branch: &str) -> Result<String, GitError> {
            self.inner.checkout(checkout, branch).await
        }

        async fn pull(&self, checkout: &Path, branch: &str) -> Result<String, GitError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let result = self.inner.pull(checkout, branch).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_releases_are_serialized() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(SlowVcs::default());
        let manager = prepared(&temp, vcs.clone()).await;

        let (handle, task) = DeployWorker::spawn(manager, None);
        let mut events = handle.subscribe();
        for commit in ["c1", "c2", "c3", "c4"] {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .submit(PushNotification::new("refs/heads/master", "acme", "site", commit))
                    .unwrap();
            });
        }

        for _ in 0..4 {
            assert!(matches!(next_event(&mut events).await, DeployEvent::Released { .. }));
        }
        assert_eq!(vcs.max_in_flight.load(Ordering::SeqCst), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let temp = TempDir::new().unwrap();
        let manager = prepared(&temp, Arc::new(FakeVcs::default())).await;

        let (handle, task) = DeployWorker::spawn(manager, None);
        handle.shutdown().unwrap();
        task.await.unwrap();

        let result = handle.submit(PushNotification::new("refs/heads/master", "acme", "site", "x"));
        assert!(matches!(result, Err(WorkerError::Closed)));
    }
}
