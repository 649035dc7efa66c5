mod adapters;
mod config;
mod core;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::{GitHubAdapter, HttpDiffSource, PullRequestRef, ReviewHost};
use crate::core::{
    ChangeType, CommentId, CommentTarget, DiffBlock, DiffParser, DiffService, DiffSource, DraftId,
    LineAnchor, LineAnnotations, LineNavigator, LocalDiffSource, NavAction, ParseRequest,
    ParsedDiff, PendingComment, PendingReview, ReviewComment, ReviewEvent, Side, Thread,
    ThreadBuilder, ThreadMap,
};

/// Navigation keys that switch between the loaded patches.
const NEXT_FILE_KEY: char = ']';
const PREVIOUS_FILE_KEY: char = '[';

#[derive(Parser)]
#[command(name = "reviewlens")]
#[command(about = "Parse pull request diffs, rebuild comment threads and submit draft reviews", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "API token for the review host (defaults to GITHUB_TOKEN)")]
    token: Option<String>,

    #[arg(long, global = true, help = "Remote diff parse endpoint")]
    parse_endpoint: Option<String>,

    #[arg(long, global = true, default_value = "text")]
    output_format: OutputFormat,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Parse a patch or a multi-file diff (reads stdin if no file is given)")]
    Parse {
        #[arg(long)]
        patch: Option<PathBuf>,

        #[arg(long, help = "File name for a single-file patch")]
        filename: Option<String>,

        #[arg(long)]
        previous_filename: Option<String>,

        #[arg(long, help = "Length of the old file, enables the trailing skip block")]
        old_lines: Option<usize>,
    },
    #[command(about = "Group a JSON list of review comments into threads")]
    Threads {
        #[arg(long)]
        comments: PathBuf,

        #[arg(long, help = "Only build threads for this file")]
        path: Option<String>,

        #[arg(long, help = "Only show threads on this line")]
        line: Option<usize>,

        #[arg(long, help = "Read --line on the old side of the diff")]
        old_side: bool,

        #[arg(long = "resolved", help = "Root comment id of a resolved thread (repeatable)")]
        resolved: Vec<CommentId>,
    },
    #[command(about = "Replay navigation keys over patches and optionally draft a comment")]
    Navigate {
        #[arg(long = "patch", required = true, help = "Patch file (repeatable; ']' and '[' switch files)")]
        patches: Vec<PathBuf>,

        #[arg(long, help = "Keys to replay, e.g. \"jJJ\" or \"g42\\n\"")]
        keys: String,

        #[arg(long, help = "Draft a comment on the resulting selection")]
        comment: Option<String>,
    },
    #[command(about = "Show one file of a pull request with its comment threads and drafts")]
    Pr {
        #[arg(long, help = "Repository as owner/name")]
        repo: String,

        #[arg(long)]
        number: u64,

        #[arg(long, default_value_t = 0, help = "Index of the file to show")]
        file: usize,

        #[arg(long, help = "Drafts (JSON) to show next to the committed threads")]
        drafts: Option<PathBuf>,
    },
    #[command(about = "Submit a review made of drafts loaded from a JSON file")]
    Submit {
        #[arg(long, help = "Repository as owner/name")]
        repo: String,

        #[arg(long)]
        number: u64,

        #[arg(long, help = "Commit the review applies to")]
        commit: String,

        #[arg(long, help = "approve, request-changes or comment")]
        event: ReviewEvent,

        #[arg(long, default_value = "")]
        body: String,

        #[arg(long)]
        drafts: PathBuf,

        #[arg(long = "drop", help = "Draft to leave out, e.g. draft-2 (repeatable)")]
        drop_drafts: Vec<DraftId>,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Deserialize)]
struct DraftInput {
    path: String,
    line: usize,
    #[serde(default)]
    side: Option<Side>,
    #[serde(default)]
    start_line: Option<usize>,
    body: String,
}

#[derive(Serialize)]
struct AnnotatedLine<'a> {
    #[serde(flatten)]
    anchor: LineAnchor,
    #[serde(flatten)]
    annotations: &'a LineAnnotations<'a>,
}

#[derive(Serialize)]
struct PrView<'a> {
    file: &'a ParsedDiff,
    lines: Vec<AnnotatedLine<'a>>,
    file_threads: Vec<&'a Thread>,
}

#[derive(Serialize)]
struct NavView<'a> {
    file: &'a str,
    focus: Option<LineAnchor>,
    anchor: Option<LineAnchor>,
    selection: Vec<LineAnchor>,
    draft: Option<&'a PendingComment>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = config::Config::load().unwrap_or_else(|err| {
        warn!("Ignoring unreadable config: {:#}", err);
        config::Config::default()
    });
    config.merge_with_cli(cli.token.clone(), cli.parse_endpoint.clone());
    config.normalize();

    match cli.command {
        Commands::Parse {
            patch,
            filename,
            previous_filename,
            old_lines,
        } => {
            parse_command(&config, patch, filename, previous_filename, old_lines, cli.output_format).await?;
        }
        Commands::Threads {
            comments,
            path,
            line,
            old_side,
            resolved,
        } => {
            let side = if old_side { Side::Left } else { Side::Right };
            let anchor = line.map(|line| LineAnchor::new(side, line));
            threads_command(comments, path, anchor, resolved, cli.output_format).await?;
        }
        Commands::Navigate { patches, keys, comment } => {
            navigate_command(&config, patches, keys, comment, cli.output_format).await?;
        }
        Commands::Pr {
            repo,
            number,
            file,
            drafts,
        } => {
            pr_command(config, repo, number, file, drafts, cli.output_format).await?;
        }
        Commands::Submit {
            repo,
            number,
            commit,
            event,
            body,
            drafts,
            drop_drafts,
        } => {
            submit_command(config, repo, number, commit, event, body, drafts, drop_drafts).await?;
        }
    }

    Ok(())
}

async fn read_input(path: Option<&Path>) -> Result<String> {
    if let Some(path) = path {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    if std::io::stdin().is_terminal() {
        anyhow::bail!("No input file given and nothing piped on stdin");
    }
    use std::io::Read;
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer)
}

async fn parse_command(
    config: &config::Config,
    patch: Option<PathBuf>,
    filename: Option<String>,
    previous_filename: Option<String>,
    old_lines: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let content = read_input(patch.as_deref()).await?;
    let options = config.parse_options();

    let files = DiffParser::split_unified_diff(&content);
    let diffs: Vec<ParsedDiff> = if files.is_empty() {
        let request = ParseRequest {
            patch: Some(content),
            filename: filename.unwrap_or_else(|| "patch".to_string()),
            previous_filename,
            content_hash: None,
            old_line_count: old_lines,
        };
        vec![DiffParser::parse_patch(&request, &options)]
    } else {
        info!("Parsed {} file diffs", files.len());
        files
            .iter()
            .map(|file| DiffParser::parse_patch(&file.to_request(), &options))
            .collect()
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diffs)?),
        OutputFormat::Text => {
            for diff in &diffs {
                print!("{}", format_diff(diff));
            }
        }
    }
    Ok(())
}

async fn threads_command(
    comments_path: PathBuf,
    path: Option<String>,
    anchor: Option<LineAnchor>,
    resolved: Vec<CommentId>,
    format: OutputFormat,
) -> Result<()> {
    let content = read_input(Some(&comments_path)).await?;
    let comments: Vec<ReviewComment> =
        serde_json::from_str(&content).context("Failed to parse comments JSON")?;

    let mut threads = match path.as_deref() {
        Some(path) => ThreadBuilder::build_for_path(&comments, path),
        None => ThreadBuilder::build(&comments),
    };
    for root_id in resolved {
        if !threads.mark_resolved(root_id) {
            warn!("No thread is rooted at comment {}", root_id);
        }
    }
    info!("Built {} threads from {} comments", threads.thread_count(), comments.len());

    match (anchor, format) {
        (Some(anchor), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(threads.threads_at(anchor))?)
        }
        (Some(anchor), OutputFormat::Text) => {
            for thread in threads.threads_at(anchor) {
                print!("{}", format_thread(thread));
            }
        }
        (None, OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(&threads.groups())?),
        (None, OutputFormat::Text) => print!("{}", format_threads(&threads)),
    }
    Ok(())
}

async fn navigate_command(
    config: &config::Config,
    patches: Vec<PathBuf>,
    keys: String,
    comment: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut diffs = Vec::with_capacity(patches.len());
    for patch in &patches {
        let request = ParseRequest {
            patch: Some(read_input(Some(patch)).await?),
            filename: patch.display().to_string(),
            ..Default::default()
        };
        diffs.push(DiffParser::parse_patch(&request, &config.parse_options()));
    }

    let mut current = 0;
    let mut navigator = LineNavigator::new(diffs[current].commentable_lines());
    for key in keys.replace("\\n", "\n").chars() {
        let switched = match key {
            NEXT_FILE_KEY => Some((current + 1).min(diffs.len() - 1)),
            PREVIOUS_FILE_KEY => Some(current.saturating_sub(1)),
            _ => None,
        };
        if let Some(index) = switched {
            current = index;
            navigator.select_file(diffs[current].commentable_lines());
            debug!("Switched to {}", diffs[current].filename);
            continue;
        }
        match NavAction::from_key(key) {
            Some(action) => {
                navigator.apply(action);
            }
            None => warn!("Ignoring unknown navigation key {:?}", key),
        }
    }
    let filename = diffs[current].filename.clone();
    debug!(
        "{} commentable lines in {}, state {:?}",
        navigator.lines().len(),
        filename,
        navigator.state()
    );

    let mut review = PendingReview::new("local");
    let draft = match comment {
        Some(body) => {
            let Some(mut composer) = navigator.start_comment() else {
                anyhow::bail!("Nothing is focused; move to a line before commenting");
            };
            debug!("Composing on {:?}", composer.target());
            composer.set_body(body);
            Some(composer.submit(&filename, &mut review, &mut navigator)?)
        }
        None => None,
    };

    let view = NavView {
        file: &filename,
        focus: navigator.focus(),
        anchor: navigator.anchor(),
        selection: navigator.selection(),
        draft: draft.as_ref(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => print!("{}", format_navigation(&view)),
    }
    Ok(())
}

fn build_diff_service(config: &config::Config) -> Result<DiffService> {
    let source: Arc<dyn DiffSource> = match &config.parse_endpoint {
        Some(endpoint) => {
            info!("Using remote parse endpoint {}", endpoint);
            Arc::new(HttpDiffSource::new(endpoint.clone(), config.request_timeout_secs)?)
        }
        None => Arc::new(LocalDiffSource::new(config.parse_options())),
    };
    Ok(DiffService::new(source, config.cache_capacity, config.prefetch()))
}

async fn load_drafts(path: &Path, commit: impl Into<String>) -> Result<PendingReview> {
    let content = read_input(Some(path)).await?;
    let inputs: Vec<DraftInput> = serde_json::from_str(&content).context("Failed to parse drafts JSON")?;

    let mut review = PendingReview::new(commit);
    for input in inputs {
        match input.side {
            None => review.add_draft(&input.path, input.line, &input.body, input.start_line)?,
            Some(side) => {
                let target = CommentTarget {
                    anchor: LineAnchor::new(side, input.line),
                    start_line: input.start_line,
                };
                review.add_draft_at(&input.path, target, &input.body)?
            }
        };
    }
    Ok(review)
}

async fn pr_command(
    config: config::Config,
    repo: String,
    number: u64,
    file_index: usize,
    drafts: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let pull = PullRequestRef::from_slug(&repo, number)?;
    info!("Reviewing {}/{}#{}", pull.owner, pull.repo, pull.number);

    let host = GitHubAdapter::new(config.host_config(), pull)?;
    let service = build_diff_service(&config)?;
    let review = match &drafts {
        Some(path) => load_drafts(path, "HEAD").await?,
        None => PendingReview::new("HEAD"),
    };

    let files = host.list_files().await?;
    let Some(file) = files.get(file_index) else {
        anyhow::bail!("Pull request has {} files, no file at index {}", files.len(), file_index);
    };

    let (diff, comments) = tokio::join!(service.request_or_empty(file), host.list_comments());
    service.select(&files, file_index).await;
    let comments = comments?;
    let threads = ThreadBuilder::build(&comments);
    let annotations = review.annotations_for(&file.filename, &threads);
    let file_threads: Vec<&Thread> = threads
        .unanchored()
        .iter()
        .filter(|thread| thread.root.path == file.filename)
        .collect();

    match format {
        OutputFormat::Json => {
            let view = PrView {
                file: &diff,
                lines: annotations
                    .iter()
                    .map(|(anchor, annotations)| AnnotatedLine {
                        anchor: *anchor,
                        annotations,
                    })
                    .collect(),
                file_threads,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        OutputFormat::Text => {
            print!("{}", format_diff(&diff));
            print!("{}", format_annotations(&annotations, &file_threads));
        }
    }

    service.wait_prefetch_idle().await;
    let stats = service.stats().await;
    info!(
        "{} diffs cached after prefetch ({} in flight, {} queued)",
        stats.cached, stats.in_flight, stats.queued
    );
    if let Some(next) = files.get(file_index + 1) {
        let ready = service.cached(next).await.is_some();
        debug!("Next file {} ready: {}", next.filename, ready);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn submit_command(
    config: config::Config,
    repo: String,
    number: u64,
    commit: String,
    event: ReviewEvent,
    body: String,
    drafts_path: PathBuf,
    drop_drafts: Vec<DraftId>,
) -> Result<()> {
    let pull = PullRequestRef::from_slug(&repo, number)?;
    let host = GitHubAdapter::new(config.host_config(), pull)?;

    let mut review = load_drafts(&drafts_path, commit).await?;
    for id in drop_drafts {
        let removed = review.remove_draft(id)?;
        info!("Left out {} on {}:{}", removed.id, removed.path, removed.line);
    }

    if review.is_empty() {
        info!("Submitting without inline comments");
    }
    for (path, count) in review.counts_by_file() {
        info!("{}: {} pending comments", path, count);
    }
    for draft in review.drafts() {
        debug!("{} {}:{} {:?}", draft.id, draft.path, draft.line, draft.side);
    }

    match review.submit(&host, event, &body).await {
        Ok(submitted) => {
            println!(
                "Submitted review {}{}",
                submitted.id,
                submitted.html_url.map(|url| format!(" ({})", url)).unwrap_or_default()
            );
            Ok(())
        }
        Err(err) => {
            anyhow::bail!("{}; {} drafts kept for retry", err, review.len());
        }
    }
}

fn format_diff(diff: &ParsedDiff) -> String {
    let mut output = String::new();
    match &diff.previous_filename {
        Some(previous) => output.push_str(&format!("=== {} -> {}\n", previous, diff.filename)),
        None => output.push_str(&format!("=== {}\n", diff.filename)),
    }
    if diff.is_empty() {
        output.push_str("    (no textual changes)\n");
    }

    for block in &diff.blocks {
        match block {
            DiffBlock::Hunk(hunk) => {
                output.push_str(&format!("{}\n", hunk.header));
                for line in &hunk.changes {
                    let marker = match line.change_type {
                        ChangeType::Added => '+',
                        ChangeType::Removed => '-',
                        ChangeType::Context => ' ',
                    };
                    output.push_str(&format!(
                        "{:>5} {:>5} {}{}\n",
                        line.old_line_no.map(|n| n.to_string()).unwrap_or_default(),
                        line.new_line_no.map(|n| n.to_string()).unwrap_or_default(),
                        marker,
                        line.content()
                    ));
                }
            }
            DiffBlock::Skip(skip) => output.push_str(&format!("      ... {} ...\n", skip.label)),
            DiffBlock::Opaque(opaque) => {
                output.push_str(&format!("{}\n", opaque.header));
                for line in &opaque.lines {
                    output.push_str(&format!("            {}\n", line));
                }
            }
        }
    }
    output
}

fn format_thread(thread: &Thread) -> String {
    let location = match thread.anchor {
        Some(LineAnchor { side: Side::Left, line }) => format!("old line {}", line),
        Some(LineAnchor { side: Side::Right, line }) => format!("new line {}", line),
        None => "file".to_string(),
    };
    let mut output = format!(
        "--- {}{}{}\n",
        location,
        if thread.outdated { " (outdated)" } else { "" },
        if thread.resolved { " (resolved)" } else { "" }
    );
    for comment in thread.comments() {
        output.push_str(&format!("  @{}: {}\n", comment.author, comment.body));
    }
    output
}

fn format_threads(threads: &ThreadMap) -> String {
    if threads.is_empty() {
        return "(no comments)\n".to_string();
    }
    threads
        .iter()
        .flat_map(|(_, line_threads)| line_threads.iter())
        .chain(threads.unanchored())
        .map(format_thread)
        .collect()
}

fn format_annotations(annotations: &BTreeMap<LineAnchor, LineAnnotations<'_>>, file_threads: &[&Thread]) -> String {
    let mut output = String::new();
    for (anchor, line) in annotations {
        for thread in &line.threads {
            output.push_str(&format_thread(thread));
        }
        for draft in &line.drafts {
            let side = match anchor.side {
                Side::Left => "old",
                Side::Right => "new",
            };
            output.push_str(&format!(
                "--- {} line {} [{}]\n  {}\n",
                side, anchor.line, draft.id, draft.body
            ));
        }
    }
    for thread in file_threads {
        output.push_str(&format_thread(thread));
    }
    output
}

fn format_navigation(view: &NavView<'_>) -> String {
    let describe = |anchor: Option<LineAnchor>| match anchor {
        Some(anchor) => format!("{:?} {}", anchor.side, anchor.line),
        None => "-".to_string(),
    };
    let mut output = format!(
        "file: {}\nfocus: {}\nanchor: {}\nselected: {} lines\n",
        view.file,
        describe(view.focus),
        describe(view.anchor),
        view.selection.len()
    );
    if let Some(draft) = view.draft {
        output.push_str(&format!(
            "{} {}:{} ({:?}) {}\n",
            draft.id, draft.path, draft.line, draft.side, draft.body
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn comment(id: u64, path: &str, line: usize, parent: Option<u64>) -> ReviewComment {
        let at = Utc::now();
        ReviewComment {
            id,
            body: format!("comment {}", id),
            path: path.to_string(),
            line: Some(line),
            original_line: Some(line),
            side: Some(Side::Right),
            start_line: None,
            start_side: None,
            in_reply_to_id: parent,
            author: "octocat".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn format_diff_shows_numbers_and_skip_labels() {
        let request = ParseRequest {
            patch: Some("@@ -1,1 +1,1 @@\n-a\n+b\n@@ -20,1 +20,1 @@\n c".to_string()),
            filename: "src/lib.rs".to_string(),
            ..Default::default()
        };
        let diff = DiffParser::parse_patch(&request, &Default::default());
        let text = format_diff(&diff);

        assert!(text.starts_with("=== src/lib.rs\n"));
        assert!(text.contains("    1       -a\n"));
        assert!(text.contains("          1 +b\n"));
        assert!(text.contains("... 18 unchanged lines ..."));
        assert!(text.contains("   20    20  c\n"));
    }

    #[test]
    fn draft_input_side_is_optional() {
        let inputs: Vec<DraftInput> = serde_json::from_str(
            r#"[{"path": "a.rs", "line": 3, "body": "hm"},
                {"path": "a.rs", "line": 4, "body": "old", "side": "LEFT"}]"#,
        )
        .unwrap();
        assert_eq!(inputs[0].side, None);
        assert_eq!(inputs[0].start_line, None);
        assert_eq!(inputs[1].side, Some(Side::Left));
    }

    #[tokio::test]
    async fn load_drafts_places_sides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"[{"path": "a.rs", "line": 3, "body": "new side"},
                {"path": "a.rs", "line": 7, "body": "old side", "side": "LEFT", "start_line": 5}]"#,
        )
        .unwrap();

        let review = load_drafts(file.path(), "abc123").await.unwrap();
        let drafts = review.drafts();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].anchor(), LineAnchor::right(3));
        assert_eq!(drafts[1].anchor(), LineAnchor::left(7));
        assert_eq!(drafts[1].start_line, Some(5));
    }

    #[test]
    fn annotations_render_threads_and_drafts_for_one_file() {
        let threads = ThreadBuilder::build(&[
            comment(1, "src/lib.rs", 10, None),
            comment(2, "src/lib.rs", 10, Some(1)),
            comment(3, "README.md", 10, None),
        ]);
        let mut review = PendingReview::new("abc123");
        let draft = review.add_draft("src/lib.rs", 12, "Rename this", None).unwrap();

        let annotations = review.annotations_for("src/lib.rs", &threads);
        let text = format_annotations(&annotations, &[]);

        assert!(text.contains("--- new line 10\n  @octocat: comment 1\n  @octocat: comment 2\n"));
        assert!(!text.contains("comment 3"));
        assert!(text.contains(&format!("--- new line 12 [{}]\n  Rename this\n", draft.id)));
    }

    #[test]
    fn resolved_threads_are_marked_in_text() {
        let mut threads = ThreadBuilder::build(&[comment(1, "src/lib.rs", 4, None)]);
        assert!(threads.mark_resolved(1));
        assert!(!threads.mark_resolved(99));

        let text = format_threads(&threads);
        assert!(text.starts_with("--- new line 4 (resolved)\n"));
        assert_eq!(format_threads(&ThreadBuilder::build(&[])), "(no comments)\n");
    }
}
