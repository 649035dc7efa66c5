pub mod cache;
pub mod diff_parser;
pub mod fetch;
pub mod navigation;
pub mod pending;
pub mod threads;

pub use cache::DEFAULT_CACHE_CAPACITY;
pub use diff_parser::{
    ChangeType, ChangedFile, ContentHash, DiffBlock, DiffParser, FileStatus, LineAnchor, ParseOptions,
    ParseRequest, ParsedDiff, Side,
};
pub use fetch::{DiffService, DiffSource, FetchError, LocalDiffSource, PrefetchConfig};
pub use navigation::{LineNavigator, NavAction};
pub use pending::{
    CommentTarget, DraftId, DraftPayload, LineAnnotations, PendingComment, PendingReview, ReviewEvent,
    ReviewSubmission, SubmissionError, SubmittedReview,
};
pub use threads::{CommentId, ReviewComment, Thread, ThreadBuilder, ThreadMap};
