use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ChangedFile, ReviewComment, ReviewSubmission, SubmissionError, SubmittedReview};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub api_base_url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    /// Builds a reference from an `owner/name` slug and a PR number.
    pub fn from_slug(slug: &str, number: u64) -> Result<Self> {
        let (owner, repo) = slug
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| anyhow::anyhow!("Invalid repository {:?}, expected owner/name", slug))?;
        if number == 0 {
            anyhow::bail!("Invalid pull request number: 0");
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }
}

/// The review-hosting service, scoped to one pull request.
#[async_trait]
pub trait ReviewHost: Send + Sync {
    async fn list_files(&self) -> Result<Vec<ChangedFile>>;
    async fn list_comments(&self) -> Result<Vec<ReviewComment>>;
    async fn submit_review(&self, submission: &ReviewSubmission) -> Result<SubmittedReview, SubmissionError>;
}
