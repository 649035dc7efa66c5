use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::host::{HostConfig, PullRequestRef, ReviewHost};
use crate::core::{
    ChangedFile, ContentHash, DraftPayload, FileStatus, ReviewComment, ReviewEvent, ReviewSubmission,
    Side, SubmissionError, SubmittedReview,
};

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 30;

pub struct GitHubAdapter {
    client: Client,
    base_url: String,
    token: Option<String>,
    pull: PullRequestRef,
}

#[derive(Deserialize)]
struct GitHubFile {
    filename: String,
    previous_filename: Option<String>,
    status: String,
    sha: Option<String>,
    patch: Option<String>,
}

#[derive(Deserialize)]
struct GitHubComment {
    id: u64,
    body: String,
    path: String,
    line: Option<usize>,
    original_line: Option<usize>,
    side: Option<Side>,
    start_line: Option<usize>,
    start_side: Option<Side>,
    in_reply_to_id: Option<u64>,
    user: Option<GitHubUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Serialize)]
struct GitHubReviewRequest<'a> {
    commit_id: &'a str,
    event: ReviewEvent,
    #[serde(skip_serializing_if = "str::is_empty")]
    body: &'a str,
    comments: &'a [DraftPayload],
}

#[derive(Deserialize)]
struct GitHubReviewResponse {
    id: u64,
    html_url: Option<String>,
}

impl From<GitHubFile> for ChangedFile {
    fn from(file: GitHubFile) -> Self {
        let status = match file.status.as_str() {
            "added" => FileStatus::Added,
            "removed" => FileStatus::Removed,
            "renamed" => FileStatus::Renamed,
            _ => FileStatus::Modified,
        };
        ChangedFile {
            filename: file.filename,
            previous_filename: file.previous_filename,
            status,
            sha: file.sha.map(ContentHash::new),
            patch: file.patch,
        }
    }
}

impl From<GitHubComment> for ReviewComment {
    fn from(comment: GitHubComment) -> Self {
        ReviewComment {
            id: comment.id,
            body: comment.body,
            path: comment.path,
            line: comment.line,
            original_line: comment.original_line,
            side: comment.side,
            start_line: comment.start_line,
            start_side: comment.start_side,
            in_reply_to_id: comment.in_reply_to_id,
            author: comment
                .user
                .map(|u| u.login)
                .unwrap_or_else(|| "ghost".to_string()),
            created_at: comment.created_at,
            updated_at: comment.updated_at,
        }
    }
}

impl GitHubAdapter {
    pub fn new(config: HostConfig, pull: PullRequestRef) -> Result<Self> {
        let token = config
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok());

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("reviewlens/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token,
            pull,
        })
    }

    fn pull_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/pulls/{}/{}",
            self.base_url, self.pull.owner, self.pull.repo, self.pull.number, suffix
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_paginated<T: DeserializeOwned>(&self, suffix: &str) -> Result<Vec<T>> {
        let url = self.pull_url(suffix);
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let response = self
                .authorized(self.client.get(&url))
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await
                .with_context(|| format!("Failed to send request to {}", url))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("GitHub API error ({}): {}", status, error_text);
            }

            let batch: Vec<T> = response
                .json()
                .await
                .with_context(|| format!("Failed to parse response from {}", url))?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                break;
            }
        }

        debug!("Fetched {} items from {}", items.len(), url);
        Ok(items)
    }
}

#[async_trait]
impl ReviewHost for GitHubAdapter {
    async fn list_files(&self) -> Result<Vec<ChangedFile>> {
        let files: Vec<GitHubFile> = self.get_paginated("files").await?;
        Ok(files.into_iter().map(ChangedFile::from).collect())
    }

    async fn list_comments(&self) -> Result<Vec<ReviewComment>> {
        let comments: Vec<GitHubComment> = self.get_paginated("comments").await?;
        Ok(comments.into_iter().map(ReviewComment::from).collect())
    }

    async fn submit_review(&self, submission: &ReviewSubmission) -> Result<SubmittedReview, SubmissionError> {
        let request = GitHubReviewRequest {
            commit_id: &submission.commit_ref,
            event: submission.event,
            body: &submission.summary_body,
            comments: &submission.comments,
        };

        let response = self
            .authorized(self.client.post(self.pull_url("reviews")))
            .json(&request)
            .send()
            .await
            .map_err(|e| SubmissionError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SubmissionError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        match serde_json::from_str::<GitHubReviewResponse>(&text) {
            Ok(review) => Ok(SubmittedReview {
                id: review.id,
                html_url: review.html_url,
            }),
            Err(err) => {
                // The host accepted the review; an unreadable body must not
                // make the caller resubmit it.
                warn!("Review accepted but response was unreadable: {}", err);
                Ok(SubmittedReview { id: 0, html_url: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn adapter(server: &mockito::Server) -> GitHubAdapter {
        let config = HostConfig {
            api_base_url: server.url(),
            token: Some("test-token".to_string()),
            timeout_secs: 5,
        };
        GitHubAdapter::new(config, PullRequestRef::from_slug("acme/widgets", 7).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_list_files_maps_status_and_hash() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/widgets/pulls/7/files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("per_page".into(), "100".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"filename": "src/new.rs", "previous_filename": "src/old.rs", "status": "renamed",
                     "sha": "deadbeef", "patch": "@@ -1 +1 @@\n-a\n+b"},
                    {"filename": "logo.png", "status": "added", "sha": "cafe"}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let files = adapter(&server).list_files().await.unwrap();
        mock.assert_async().await;

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].status, FileStatus::Renamed);
        assert_eq!(files[0].previous_filename.as_deref(), Some("src/old.rs"));
        assert_eq!(files[0].content_key(), ContentHash::new("deadbeef"));
        assert_eq!(files[1].status, FileStatus::Added);
        assert!(files[1].patch.is_none());
    }

    #[tokio::test]
    async fn test_list_comments_maps_authors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/widgets/pulls/7/comments")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"id": 1, "body": "Why?", "path": "src/lib.rs", "line": 10, "original_line": 10,
                     "side": "RIGHT", "user": {"login": "octocat"},
                     "created_at": "2024-05-01T12:00:00Z", "updated_at": "2024-05-01T12:00:00Z"},
                    {"id": 2, "body": "Because.", "path": "src/lib.rs", "line": null, "original_line": 10,
                     "side": "RIGHT", "in_reply_to_id": 1, "user": null,
                     "created_at": "2024-05-01T12:05:00Z", "updated_at": "2024-05-01T12:05:00Z"}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let comments = adapter(&server).list_comments().await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "octocat");
        assert_eq!(comments[0].side, Some(Side::Right));
        assert_eq!(comments[1].author, "ghost");
        assert_eq!(comments[1].in_reply_to_id, Some(1));
    }

    #[tokio::test]
    async fn test_list_fails_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/widgets/pulls/7/files")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("Not Found")
            .create_async()
            .await;

        let err = adapter(&server).list_files().await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    fn submission() -> ReviewSubmission {
        ReviewSubmission {
            commit_ref: "abc123".to_string(),
            event: ReviewEvent::RequestChanges,
            summary_body: "Please split this up".to_string(),
            comments: vec![DraftPayload {
                path: "src/lib.rs".to_string(),
                line: 12,
                body: "Extract this".to_string(),
                side: Side::Right,
                start_line: Some(10),
                start_side: Some(Side::Right),
            }],
        }
    }

    #[tokio::test]
    async fn test_submit_review_sends_one_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/repos/acme/widgets/pulls/7/reviews")
            .match_body(Matcher::PartialJson(json!({
                "commit_id": "abc123",
                "event": "REQUEST_CHANGES",
                "body": "Please split this up",
                "comments": [{"path": "src/lib.rs", "line": 12, "side": "RIGHT",
                              "start_line": 10, "start_side": "RIGHT", "body": "Extract this"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 991, "html_url": "https://github.com/acme/widgets/pull/7#pullrequestreview-991"}"#)
            .expect(1)
            .create_async()
            .await;

        let review = adapter(&server).submit_review(&submission()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(review.id, 991);
    }

    #[tokio::test]
    async fn test_submit_review_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/repos/acme/widgets/pulls/7/reviews")
            .with_status(422)
            .with_body(r#"{"message": "Unprocessable Entity"}"#)
            .create_async()
            .await;

        let err = adapter(&server).submit_review(&submission()).await.unwrap_err();
        match err {
            SubmissionError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert!(message.contains("Unprocessable"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
