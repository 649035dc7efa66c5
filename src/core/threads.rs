use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::core::diff_parser::{LineAnchor, Side};

pub type CommentId = u64;

/// A review comment as persisted by the review host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: CommentId,
    pub body: String,
    pub path: String,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub original_line: Option<usize>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub start_side: Option<Side>,
    #[serde(default)]
    pub in_reply_to_id: Option<CommentId>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub anchor: Option<LineAnchor>,
    pub start_line: Option<usize>,
    /// Anchored through the root's original line because its live line is gone.
    pub outdated: bool,
    pub resolved: bool,
    pub root: ReviewComment,
    pub replies: Vec<ReviewComment>,
}

impl Thread {
    fn seed(root: ReviewComment) -> Self {
        let (anchor, outdated) = match (root.line, root.original_line) {
            (Some(line), _) => (Some(line), false),
            (None, Some(original)) => (Some(original), true),
            (None, None) => (None, false),
        };
        let side = root.side.unwrap_or_default();
        Self {
            anchor: anchor.map(|line| LineAnchor::new(side, line)),
            start_line: root.start_line,
            outdated,
            resolved: false,
            root,
            replies: Vec::new(),
        }
    }

    pub fn id(&self) -> CommentId {
        self.root.id
    }

    pub fn comments(&self) -> impl Iterator<Item = &ReviewComment> {
        std::iter::once(&self.root).chain(self.replies.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadGroup<'a> {
    pub anchor: LineAnchor,
    pub threads: &'a [Thread],
}

/// Reply threads keyed by the line they are anchored to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadMap {
    by_anchor: BTreeMap<LineAnchor, Vec<Thread>>,
    unanchored: Vec<Thread>,
}

impl ThreadMap {
    pub fn threads_at(&self, anchor: LineAnchor) -> &[Thread] {
        self.by_anchor.get(&anchor).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Threads that have no line at all (file-level comments).
    pub fn unanchored(&self) -> &[Thread] {
        &self.unanchored
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LineAnchor, &Vec<Thread>)> {
        self.by_anchor.iter()
    }

    pub fn groups(&self) -> Vec<ThreadGroup<'_>> {
        self.by_anchor
            .iter()
            .map(|(anchor, threads)| ThreadGroup {
                anchor: *anchor,
                threads,
            })
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.by_anchor.values().map(Vec::len).sum::<usize>() + self.unanchored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thread_count() == 0
    }

    pub fn mark_resolved(&mut self, root_id: CommentId) -> bool {
        let thread = self
            .by_anchor
            .values_mut()
            .flat_map(|threads| threads.iter_mut())
            .chain(self.unanchored.iter_mut())
            .find(|thread| thread.id() == root_id);
        match thread {
            Some(thread) => {
                thread.resolved = true;
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, thread: Thread) {
        match thread.anchor {
            Some(anchor) => self.by_anchor.entry(anchor).or_default().push(thread),
            None => self.unanchored.push(thread),
        }
    }
}

pub struct ThreadBuilder;

impl ThreadBuilder {
    /// Groups a flat comment list into threads. Replies are attached to the
    /// root of their reply chain and ordered by creation time; replies whose
    /// chain does not reach a root are dropped.
    pub fn build(comments: &[ReviewComment]) -> ThreadMap {
        let by_id: HashMap<CommentId, &ReviewComment> = comments.iter().map(|c| (c.id, c)).collect();

        let mut order = Vec::new();
        let mut threads: HashMap<CommentId, Thread> = HashMap::new();
        for comment in comments.iter().filter(|c| c.in_reply_to_id.is_none()) {
            if threads.insert(comment.id, Thread::seed(comment.clone())).is_none() {
                order.push(comment.id);
            }
        }

        for reply in comments.iter().filter(|c| c.in_reply_to_id.is_some()) {
            let thread = Self::resolve_root(reply, &by_id).and_then(|root| threads.get_mut(&root));
            match thread {
                Some(thread) => thread.replies.push(reply.clone()),
                None => debug!(
                    "Dropping orphaned reply {} (parent {:?} not found)",
                    reply.id, reply.in_reply_to_id
                ),
            }
        }

        let mut map = ThreadMap::default();
        for id in order {
            if let Some(mut thread) = threads.remove(&id) {
                thread
                    .replies
                    .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                map.insert(thread);
            }
        }

        for threads in map.by_anchor.values_mut() {
            threads.sort_by(|a, b| {
                a.root
                    .created_at
                    .cmp(&b.root.created_at)
                    .then(a.root.id.cmp(&b.root.id))
            });
        }

        map
    }

    /// Builds the threads of a single file.
    pub fn build_for_path(comments: &[ReviewComment], path: &str) -> ThreadMap {
        let scoped: Vec<ReviewComment> = comments.iter().filter(|c| c.path == path).cloned().collect();
        Self::build(&scoped)
    }

    fn resolve_root(reply: &ReviewComment, by_id: &HashMap<CommentId, &ReviewComment>) -> Option<CommentId> {
        let mut visited = HashSet::from([reply.id]);
        let mut current = reply.in_reply_to_id?;
        loop {
            if !visited.insert(current) {
                return None;
            }
            let parent = by_id.get(&current)?;
            match parent.in_reply_to_id {
                None => return Some(parent.id),
                Some(next) => current = next,
            }
        }
    }
}
