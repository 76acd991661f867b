use crate::config::GitAuthConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository, ResetType};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

/// Handle on the configuration repository checkout. Holds only paths and
/// credentials; the libgit2 repository object is reopened per operation so
/// the handle stays `Send + Sync` and can cross task boundaries.
#[derive(Clone)]
pub struct GitRepository {
    path: PathBuf,
    branch: String,
    auth: GitAuthConfig,
}

impl GitRepository {
    /// Open the existing checkout at `path`, or clone `url` into it.
    pub fn init(url: &str, branch: &str, auth: &GitAuthConfig, path: &Path) -> Result<Self> {
        let handle = Self {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            auth: auth.clone(),
        };

        if path.join(".git").exists() {
            Repository::open(path)?;
            debug!("opened existing checkout at {}", path.display());
        } else {
            info!("cloning {} (branch {}) into {}", url, branch, path.display());
            RepoBuilder::new()
                .branch(branch)
                .fetch_options(handle.fetch_options())
                .clone(url, path)?;
        }

        Ok(handle)
    }

    /// Fetch the configured branch and hard-reset the work tree to its
    /// remote head. Returns the head commit and whether it moved.
    pub fn pull(&self) -> Result<(CommitInfo, bool)> {
        let repo = Repository::open(&self.path)?;
        let old_head = repo.head().ok().and_then(|h| h.target());

        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &[self.branch.as_str()],
            Some(&mut self.fetch_options()),
            None,
        )?;

        let remote_ref = format!("refs/remotes/origin/{}", self.branch);
        let target = repo
            .find_reference(&remote_ref)?
            .target()
            .ok_or_else(|| {
                Error::Git(git2::Error::from_str(&format!(
                    "{remote_ref} is not a direct reference"
                )))
            })?;

        let object = repo.find_object(target, None)?;
        repo.reset(&object, ResetType::Hard, None)?;

        let commit = repo.find_commit(target)?;
        let author = commit.author();
        let info = CommitInfo {
            hash: target.to_string(),
            message: commit.message().unwrap_or_default().trim_end().to_string(),
            author: author.name().unwrap_or_default().to_string(),
            timestamp: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)
                .unwrap_or_else(Utc::now),
        };

        let has_changes = old_head != Some(target);
        debug!(
            "pulled {}: head {} ({})",
            self.branch,
            &info.hash[..12.min(info.hash.len())],
            if has_changes { "moved" } else { "unchanged" }
        );
        Ok((info, has_changes))
    }

    /// Absolute path of a file inside the checkout.
    pub fn file_path(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let auth = self.auth.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            match auth.auth_type.as_str() {
                "token" => {
                    let token = auth.token.as_deref().unwrap_or_default();
                    Cred::userpass_plaintext("x-access-token", token)
                }
                "ssh" => {
                    let key = auth.ssh_key_path.as_deref().unwrap_or_default();
                    Cred::ssh_key(
                        username_from_url.unwrap_or("git"),
                        None,
                        Path::new(key),
                        None,
                    )
                }
                _ => Cred::default(),
            }
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::TempDir;

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) -> git2::Oid {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("operator", "ops@example.com").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .map(|oid| repo.find_commit(oid).unwrap());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn upstream_with_commit() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let upstream_path = dir.path().join("upstream");
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("refs/heads/main");
        let upstream = Repository::init_opts(&upstream_path, &opts).unwrap();
        commit_file(&upstream, "server.toml", "# config\n", "initial config");
        (dir, upstream_path)
    }

    #[test]
    fn init_clones_and_pull_reports_no_movement() {
        let (dir, upstream_path) = upstream_with_commit();
        let checkout = dir.path().join("checkout");
        let auth = GitAuthConfig::default();

        let repo = GitRepository::init(
            upstream_path.to_str().unwrap(),
            "main",
            &auth,
            &checkout,
        )
        .unwrap();

        let (info, changed) = repo.pull().unwrap();
        assert!(!changed);
        assert_eq!(info.author, "operator");
        assert_eq!(info.message, "initial config");
        assert!(checkout.join("server.toml").exists());
    }

    #[test]
    fn pull_picks_up_new_upstream_commit() {
        let (dir, upstream_path) = upstream_with_commit();
        let checkout = dir.path().join("checkout");
        let auth = GitAuthConfig::default();
        let repo = GitRepository::init(
            upstream_path.to_str().unwrap(),
            "main",
            &auth,
            &checkout,
        )
        .unwrap();
        let (first, _) = repo.pull().unwrap();

        let upstream = Repository::open(&upstream_path).unwrap();
        commit_file(&upstream, "server.toml", "# updated\n", "update config");

        let (second, changed) = repo.pull().unwrap();
        assert!(changed);
        assert_ne!(first.hash, second.hash);
        assert_eq!(second.message, "update config");
        let content = fs::read_to_string(checkout.join("server.toml")).unwrap();
        assert_eq!(content, "# updated\n");
    }

    #[test]
    fn init_reopens_existing_checkout() {
        let (dir, upstream_path) = upstream_with_commit();
        let checkout = dir.path().join("checkout");
        let auth = GitAuthConfig::default();
        GitRepository::init(upstream_path.to_str().unwrap(), "main", &auth, &checkout).unwrap();
        // second init must not re-clone
        let repo =
            GitRepository::init(upstream_path.to_str().unwrap(), "main", &auth, &checkout).unwrap();
        assert!(repo.pull().is_ok());
    }
}
