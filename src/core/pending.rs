use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::adapters::host::ReviewHost;
use crate::core::diff_parser::{LineAnchor, Side};
use crate::core::threads::{Thread, ThreadMap};

/// Identifier of a draft. Drafts live in their own id space, so a draft can
/// never be mistaken for a persisted comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DraftId(u64);

impl fmt::Display for DraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "draft-{}", self.0)
    }
}

impl FromStr for DraftId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("draft-")
            .unwrap_or(s)
            .parse()
            .map(DraftId)
            .map_err(|_| format!("invalid draft id: {}", s))
    }
}

/// Where a new comment goes: the anchor line plus an optional first line
/// for multi-line comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentTarget {
    pub anchor: LineAnchor,
    pub start_line: Option<usize>,
}

impl CommentTarget {
    pub fn line(anchor: LineAnchor) -> Self {
        Self {
            anchor,
            start_line: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingComment {
    pub id: DraftId,
    pub path: String,
    pub line: usize,
    pub side: Side,
    pub start_line: Option<usize>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl PendingComment {
    pub fn anchor(&self) -> LineAnchor {
        LineAnchor::new(self.side, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl FromStr for ReviewEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "approve" => Ok(ReviewEvent::Approve),
            "request-changes" => Ok(ReviewEvent::RequestChanges),
            "comment" => Ok(ReviewEvent::Comment),
            other => Err(format!("unknown review event: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftPayload {
    pub path: String,
    pub line: usize,
    pub body: String,
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_side: Option<Side>,
}

/// Everything sent to the review host in a single submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub commit_ref: String,
    pub event: ReviewEvent,
    pub summary_body: String,
    pub comments: Vec<DraftPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedReview {
    pub id: u64,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmissionError {
    #[error("review host rejected the submission ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not reach review host: {0}")]
    Transport(String),
    #[error("invalid review: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReviewError {
    #[error("comment body is empty")]
    EmptyBody,
    #[error("no pending comment {0}")]
    UnknownDraft(DraftId),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// Committed threads and drafts on one line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LineAnnotations<'a> {
    pub threads: Vec<&'a Thread>,
    pub drafts: Vec<&'a PendingComment>,
}

/// Draft comments of the review in progress.
pub struct PendingReview {
    commit_ref: String,
    drafts: Vec<PendingComment>,
    next_id: u64,
}

impl PendingReview {
    pub fn new(commit_ref: impl Into<String>) -> Self {
        Self {
            commit_ref: commit_ref.into(),
            drafts: Vec::new(),
            next_id: 1,
        }
    }

    /// Adds a draft on the new side of `path`.
    pub fn add_draft(
        &mut self,
        path: &str,
        line: usize,
        body: &str,
        start_line: Option<usize>,
    ) -> Result<PendingComment, ReviewError> {
        let target = CommentTarget {
            anchor: LineAnchor::right(line),
            start_line,
        };
        self.add_draft_at(path, target, body)
    }

    pub fn add_draft_at(
        &mut self,
        path: &str,
        target: CommentTarget,
        body: &str,
    ) -> Result<PendingComment, ReviewError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ReviewError::EmptyBody);
        }

        let id = DraftId(self.next_id);
        self.next_id += 1;

        let draft = PendingComment {
            id,
            path: path.to_string(),
            line: target.anchor.line,
            side: target.anchor.side,
            start_line: target.start_line.filter(|start| *start < target.anchor.line),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        self.drafts.push(draft.clone());
        Ok(draft)
    }

    pub fn remove_draft(&mut self, id: DraftId) -> Result<PendingComment, ReviewError> {
        let index = self
            .drafts
            .iter()
            .position(|draft| draft.id == id)
            .ok_or(ReviewError::UnknownDraft(id))?;
        Ok(self.drafts.remove(index))
    }

    pub fn drafts(&self) -> &[PendingComment] {
        &self.drafts
    }

    pub fn drafts_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a PendingComment> + 'a {
        self.drafts.iter().filter(move |draft| draft.path == path)
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn counts_by_file(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for draft in &self.drafts {
            *counts.entry(draft.path.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Merges the committed threads of `path` with its drafts, per line.
    /// `threads` may cover the whole review; only threads rooted in `path`
    /// are taken.
    pub fn annotations_for<'a>(
        &'a self,
        path: &'a str,
        threads: &'a ThreadMap,
    ) -> BTreeMap<LineAnchor, LineAnnotations<'a>> {
        let mut merged: BTreeMap<LineAnchor, LineAnnotations<'a>> = BTreeMap::new();
        for (anchor, line_threads) in threads.iter() {
            for thread in line_threads.iter().filter(|thread| thread.root.path == path) {
                merged.entry(*anchor).or_default().threads.push(thread);
            }
        }
        for draft in self.drafts_for(path) {
            merged.entry(draft.anchor()).or_default().drafts.push(draft);
        }
        merged
    }

    pub fn to_submission(&self, event: ReviewEvent, summary: &str) -> ReviewSubmission {
        ReviewSubmission {
            commit_ref: self.commit_ref.clone(),
            event,
            summary_body: summary.trim().to_string(),
            comments: self
                .drafts
                .iter()
                .map(|draft| DraftPayload {
                    path: draft.path.clone(),
                    line: draft.line,
                    body: draft.body.clone(),
                    side: draft.side,
                    start_line: draft.start_line,
                    start_side: draft.start_line.map(|_| draft.side),
                })
                .collect(),
        }
    }

    /// Submits every draft in one call. Drafts are cleared only once the
    /// host confirms; on any error they are left exactly as they were.
    pub async fn submit(
        &mut self,
        host: &dyn ReviewHost,
        event: ReviewEvent,
        summary: &str,
    ) -> Result<SubmittedReview, SubmissionError> {
        let submission = self.to_submission(event, summary);
        Self::validate(&submission)?;

        info!(
            "Submitting review ({:?}) with {} comments",
            event,
            submission.comments.len()
        );
        match host.submit_review(&submission).await {
            Ok(review) => {
                self.drafts.clear();
                Ok(review)
            }
            Err(err) => {
                warn!("Review submission failed, keeping {} drafts: {}", self.drafts.len(), err);
                Err(err)
            }
        }
    }

    fn validate(submission: &ReviewSubmission) -> Result<(), SubmissionError> {
        match submission.event {
            ReviewEvent::Approve => Ok(()),
            ReviewEvent::RequestChanges if submission.summary_body.is_empty() => Err(
                SubmissionError::Invalid("requesting changes needs a summary".to_string()),
            ),
            ReviewEvent::Comment if submission.summary_body.is_empty() && submission.comments.is_empty() => {
                Err(SubmissionError::Invalid(
                    "a comment review needs a summary or at least one comment".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}
