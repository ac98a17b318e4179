use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use hf_hub::{api::tokio::Api, Repo, RepoType};

use crate::Error;

/// Where a pre-trained checkpoint lives: a hub repository or a local
/// directory laid out the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Hub {
        repo: String,
        revision: Option<String>,
    },
    Local(PathBuf),
}

impl ModelSource {
    /// An existing directory is a local checkpoint, anything else is read as
    /// `repo` or `repo@revision` on the hub.
    pub fn parse(s: &str) -> Self {
        let path = Path::new(s);
        if path.is_dir() {
            return Self::Local(path.to_path_buf());
        }
        match s.split_once('@') {
            Some((repo, revision)) if !revision.is_empty() => Self::Hub {
                repo: repo.to_string(),
                revision: Some(revision.to_string()),
            },
            _ => Self::Hub {
                repo: s.trim_end_matches('@').to_string(),
                revision: None,
            },
        }
    }

    pub fn hub(repo: impl Into<String>) -> Self {
        Self::Hub {
            repo: repo.into(),
            revision: None,
        }
    }

    /// The name used to detect the model variant.
    pub fn name(&self) -> String {
        match self {
            Self::Hub { repo, .. } => repo.clone(),
            Self::Local(path) => path.display().to_string(),
        }
    }

    /// Path of a local file, `None` for hub sources or files that are absent.
    pub fn local_file(&self, file: &str) -> Option<PathBuf> {
        match self {
            Self::Local(dir) => Some(dir.join(file)).filter(|path| path.is_file()),
            Self::Hub { .. } => None,
        }
    }

    /// Returns a local path to `file`, downloading it into the hub cache when needed.
    pub async fn resolve(&self, api: &Api, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::MissingFile(path).into())
                }
            }
            Self::Hub { repo, revision } => {
                let repo = match revision {
                    Some(revision) => {
                        Repo::with_revision(repo.clone(), RepoType::Model, revision.clone())
                    }
                    None => Repo::model(repo.clone()),
                };
                api.repo(repo)
                    .get(file)
                    .await
                    .with_context(|| format!("failed to fetch {file} from {self}"))
            }
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub {
                repo,
                revision: Some(revision),
            } => write!(f, "{repo}@{revision}"),
            Self::Hub { repo, .. } => write!(f, "{repo}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}
