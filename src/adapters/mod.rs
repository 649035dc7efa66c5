pub mod github;
pub mod host;
pub mod parse_service;

pub use github::GitHubAdapter;
pub use host::{HostConfig, PullRequestRef, ReviewHost};
pub use parse_service::HttpDiffSource;
