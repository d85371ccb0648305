//! Local git checkouts for the scanner.
//!
//! Layout under the configured work dir:
//! `<instance>/<project_key>/{repo,worktrees/<sha>,configs}`. Every git
//! operation touching `repo` holds that repository's async lock; scans of
//! different commits run concurrently in separate worktrees.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ScanFailure, tail};

const GIT_OUTPUT_LIMIT: usize = 2_000;

/// Owns the clones and worktrees used by scans.
#[derive(Clone)]
pub struct RepoWorkspace {
    root: PathBuf,
    git: String,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl fmt::Debug for RepoWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoWorkspace")
            .field("root", &self.root)
            .field("git", &self.git)
            .field("repositories", &self.locks.lock().len())
            .finish()
    }
}

/// A detached checkout of one commit.
///
/// Removed by [`remove`](Self::remove). A worktree dropped without it, for
/// instance when the attempt that owns it hits its deadline, schedules its
/// own removal on the current runtime.
pub struct Worktree {
    path: PathBuf,
    repo: PathBuf,
    workspace: Option<RepoWorkspace>,
}

impl fmt::Debug for Worktree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worktree")
            .field("path", &self.path)
            .field("repo", &self.repo)
            .field("live", &self.workspace.is_some())
            .finish()
    }
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the checkout and wait for it to be gone.
    pub async fn remove(mut self) {
        if let Some(workspace) = self.workspace.take() {
            workspace.remove_locked(&self.repo, &self.path).await;
        }
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        let Some(workspace) = self.workspace.take() else {
            return;
        };
        let repo = std::mem::take(&mut self.repo);
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(
                    target: "scan::git",
                    path = %path.display(),
                    "worktree dropped mid-scan, scheduling removal"
                );
                runtime.spawn(async move {
                    workspace.remove_locked(&repo, &path).await;
                });
            }
            Err(_) => warn!(
                target: "scan::git",
                path = %path.display(),
                "worktree dropped outside a runtime; left on disk"
            ),
        }
    }
}

/// `https://host/org/repo` and `https://host/org/repo.git/` name the same
/// remote.
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with(".git") {
        trimmed.to_string()
    } else {
        format!("{trimmed}.git")
    }
}

impl RepoWorkspace {
    /// Relative roots are resolved against the current directory so git
    /// commands run from inside a clone see the same paths.
    pub fn new(root: impl Into<PathBuf>, git: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: std::path::absolute(&root).unwrap_or(root),
            git: git.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn project_dir(&self, instance_id: &str, project_key: &str) -> PathBuf {
        self.root.join(instance_id).join(project_key)
    }

    fn lock_for(&self, repo: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(repo.to_path_buf()).or_default())
    }

    /// Clone or refresh the repository and add a detached worktree at
    /// `commit_sha`.
    pub async fn checkout(
        &self,
        instance_id: &str,
        project_key: &str,
        repository_url: &str,
        commit_sha: &str,
    ) -> Result<Worktree, ScanFailure> {
        let project_dir = self.project_dir(instance_id, project_key);
        let repo = project_dir.join("repo");
        let target = project_dir.join("worktrees").join(commit_sha);
        let url = normalize_repo_url(repository_url);

        let lock = self.lock_for(&repo);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(project_dir.join("worktrees")).await?;
        self.ensure_clone(&repo, &url).await?;
        self.refresh(&repo, &url).await;

        if !self.commit_exists(&repo, commit_sha).await {
            debug!(
                target: "scan::git",
                commit = commit_sha,
                "commit missing after refresh, fetching it directly"
            );
            if let Err(err) =
                self.git(&repo, &["fetch", "origin", commit_sha]).await
            {
                debug!(target: "scan::git", error = %err, "direct fetch failed");
            }
            if !self.commit_exists(&repo, commit_sha).await {
                return Err(ScanFailure::MissingCommit(commit_sha.to_string()));
            }
        }

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            self.discard_worktree(&repo, &target).await;
        }
        let target_arg = target.to_string_lossy().into_owned();
        self.git(
            &repo,
            &["worktree", "add", "--detach", &target_arg, commit_sha],
        )
        .await?;
        let _ = self.git(&target, &["clean", "-fdx"]).await;

        Ok(Worktree {
            path: target,
            repo,
            workspace: Some(self.clone()),
        })
    }

    async fn remove_locked(&self, repo: &Path, target: &Path) {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;
        self.discard_worktree(repo, target).await;
    }

    /// Write an override to a content-addressed properties file so identical
    /// overrides share one file.
    pub async fn write_override(
        &self,
        instance_id: &str,
        project_key: &str,
        content: &str,
    ) -> Result<PathBuf, ScanFailure> {
        let dir = self.project_dir(instance_id, project_key).join("configs");
        tokio::fs::create_dir_all(&dir).await?;
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        let path = dir.join(format!("override_{digest}.properties"));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, content).await?;
        }
        Ok(path)
    }

    async fn ensure_clone(
        &self,
        repo: &Path,
        url: &str,
    ) -> Result<(), ScanFailure> {
        if tokio::fs::try_exists(repo.join(".git")).await.unwrap_or(false) {
            return Ok(());
        }
        if tokio::fs::try_exists(repo).await.unwrap_or(false) {
            warn!(target: "scan::git", path = %repo.display(), "removing broken clone");
            tokio::fs::remove_dir_all(repo).await?;
        }
        info!(target: "scan::git", url, "cloning repository");
        let parent = repo.parent().unwrap_or(&self.root);
        let repo_arg = repo.to_string_lossy().into_owned();
        self.git(parent, &["clone", url, &repo_arg]).await?;
        Ok(())
    }

    /// Best effort: a failed fetch still leaves older commits usable.
    async fn refresh(&self, repo: &Path, url: &str) {
        let steps: [&[&str]; 3] = [
            &["remote", "set-url", "origin", url],
            &["fetch", "origin", "+refs/pull/*/head:refs/remotes/origin/pr/*"],
            &["fetch", "--all", "--tags", "--prune"],
        ];
        for args in steps {
            if let Err(err) = self.git(repo, args).await {
                debug!(target: "scan::git", error = %err, "refresh step failed");
            }
        }
    }

    async fn commit_exists(&self, repo: &Path, commit_sha: &str) -> bool {
        let object = format!("{commit_sha}^{{commit}}");
        self.git(repo, &["cat-file", "-e", &object]).await.is_ok()
    }

    async fn discard_worktree(&self, repo: &Path, target: &Path) {
        let target_arg = target.to_string_lossy().into_owned();
        let _ = self
            .git(repo, &["worktree", "remove", "--force", &target_arg])
            .await;
        if tokio::fs::try_exists(target).await.unwrap_or(false)
            && let Err(err) = tokio::fs::remove_dir_all(target).await
        {
            warn!(
                target: "scan::git",
                path = %target.display(),
                error = %err,
                "failed to remove worktree directory"
            );
        }
        let _ = self.git(repo, &["worktree", "prune"]).await;
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, ScanFailure> {
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(ScanFailure::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: tail(text.trim(), GIT_OUTPUT_LIMIT).to_string(),
            })
        }
    }
}
