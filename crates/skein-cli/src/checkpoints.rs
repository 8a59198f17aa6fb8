//! Workspace checkpoints in a shadow git repository
//!
//! The repository lives outside the workspace (`GIT_DIR` under the task's
//! data directory) so the project's own git state is never touched.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use skein_task::error::{Error, Result};
use skein_task::{CheckpointService, FileChange};
use tokio::process::Command;
use tokio::sync::Mutex;

pub struct GitCheckpointService {
    git_dir: PathBuf,
    workspace: PathBuf,
    /// Serializes git invocations; also records whether the repo exists yet
    initialized: Mutex<bool>,
}

impl GitCheckpointService {
    pub fn new(git_dir: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            workspace: workspace.into(),
            initialized: Mutex::new(false),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.workspace)
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to run git: {}", e)))?;
        Ok(output)
    }

    /// Run git and fail on a non-zero exit
    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(Error::Checkpoint(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ensure_repo(&self, initialized: &mut bool) -> Result<()> {
        if *initialized {
            return Ok(());
        }
        if !self.git_dir.join("HEAD").exists() {
            tokio::fs::create_dir_all(&self.git_dir).await?;
            self.git_ok(&["init", "--quiet"]).await?;
            self.git_ok(&["config", "user.name", "skein"]).await?;
            self.git_ok(&["config", "user.email", "checkpoints@skein.invalid"]).await?;
            self.git_ok(&["config", "commit.gpgsign", "false"]).await?;
            tracing::debug!(git_dir = %self.git_dir.display(), "initialized checkpoint repository");
        }
        *initialized = true;
        Ok(())
    }

    /// File content at `commit`, empty when the file did not exist there
    async fn show(&self, commit: &str, path: &str) -> Result<String> {
        let object = format!("{}:{}", commit, path);
        let output = self.git(&["show", &object]).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Ok(String::new())
        }
    }

    async fn read_workspace(&self, path: &str) -> String {
        tokio::fs::read_to_string(self.workspace.join(path))
            .await
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointService for GitCheckpointService {
    async fn save_checkpoint(&self, label: &str) -> Result<String> {
        let mut initialized = self.initialized.lock().await;
        self.ensure_repo(&mut initialized).await?;
        self.git_ok(&["add", "--all"]).await?;
        self.git_ok(&["commit", "--quiet", "--allow-empty", "--no-verify", "-m", label])
            .await?;
        let commit = self.git_ok(&["rev-parse", "HEAD"]).await?;
        Ok(commit.trim().to_string())
    }

    async fn restore(&self, commit: &str) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        self.ensure_repo(&mut initialized).await?;
        self.git_ok(&["clean", "--force", "-d", "--quiet"]).await?;
        self.git_ok(&["reset", "--hard", "--quiet", commit]).await?;
        Ok(())
    }

    async fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>> {
        let mut initialized = self.initialized.lock().await;
        self.ensure_repo(&mut initialized).await?;
        let names = match to {
            Some(to) => self.git_ok(&["diff", "--name-only", from, to]).await?,
            None => {
                // Stage so untracked files show up too
                self.git_ok(&["add", "--all"]).await?;
                self.git_ok(&["diff", "--cached", "--name-only", from]).await?
            }
        };

        let mut changes = Vec::new();
        for path in names.lines().filter(|l| !l.is_empty()) {
            let before = self.show(from, path).await?;
            let after = match to {
                Some(to) => self.show(to, path).await?,
                None => self.read_workspace(path).await,
            };
            changes.push(FileChange {
                path: path.to_string(),
                before,
                after,
            });
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn test_save_restore_and_diff() {
        if !git_available().await {
            return;
        }
        let data = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("a.txt"), "one").unwrap();
        let service = GitCheckpointService::new(data.path().join("shadow"), workspace.path());

        let first = service.save_checkpoint("first").await.unwrap();
        std::fs::write(workspace.path().join("a.txt"), "two").unwrap();
        std::fs::write(workspace.path().join("b.txt"), "new").unwrap();

        let changes = service.diff(&first, None).await.unwrap();
        let a = changes.iter().find(|c| c.path == "a.txt").unwrap();
        assert_eq!((a.before.as_str(), a.after.as_str()), ("one", "two"));
        assert!(changes.iter().any(|c| c.path == "b.txt" && c.before.is_empty()));

        let second = service.save_checkpoint("second").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(service.diff(&first, Some(&second)).await.unwrap().len(), 2);

        service.restore(&first).await.unwrap();
        assert_eq!(std::fs::read_to_string(workspace.path().join("a.txt")).unwrap(), "one");
        assert!(!workspace.path().join("b.txt").exists());
        // The project itself never becomes a repository
        assert!(!workspace.path().join(".git").exists());
    }
}
