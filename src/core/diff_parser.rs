use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use std::fmt;
use tracing::debug;

/// Lines longer than this are not word-diffed against their counterpart.
const MAX_INLINE_DIFF_LEN: usize = 2_000;

static HUNK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@ ?(.*)$")
        .expect("hunk header pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Hash used when the host did not supply a blob hash for a file.
    pub fn of_file(filename: &str, patch: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update([0u8]);
        hasher.update(patch.unwrap_or_default().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which version of the file a line (or comment) refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// The old revision ("before").
    Left,
    /// The new revision ("after").
    Right,
}

impl Default for Side {
    fn default() -> Self {
        Side::Right
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineAnchor {
    pub side: Side,
    pub line: usize,
}

impl LineAnchor {
    pub fn new(side: Side, line: usize) -> Self {
        Self { side, line }
    }

    pub fn right(line: usize) -> Self {
        Self::new(Side::Right, line)
    }

    pub fn left(line: usize) -> Self {
        Self::new(Side::Left, line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Removed,
    Modified,
    Renamed,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::Modified
    }
}

/// One file of a change set, as listed by the review host or split out of a
/// multi-file diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    #[serde(default)]
    pub previous_filename: Option<String>,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub sha: Option<ContentHash>,
    #[serde(default)]
    pub patch: Option<String>,
}

impl ChangedFile {
    pub fn content_key(&self) -> ContentHash {
        self.sha
            .clone()
            .unwrap_or_else(|| ContentHash::of_file(&self.filename, self.patch.as_deref()))
    }

    pub fn to_request(&self) -> ParseRequest {
        ParseRequest {
            patch: self.patch.clone(),
            filename: self.filename.clone(),
            previous_filename: self.previous_filename.clone(),
            content_hash: Some(self.content_key()),
            old_line_count: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRequest {
    pub patch: Option<String>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    /// Length of the old file, when known. Enables the trailing skip block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_line_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseOptions {
    /// Gaps of unchanged lines larger than this become skip blocks.
    pub skip_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDiff {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(rename = "hunks")]
    pub blocks: Vec<DiffBlock>,
}

impl ParsedDiff {
    pub fn empty(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            previous_filename: None,
            content_hash: None,
            blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn hunks(&self) -> impl Iterator<Item = &DiffHunk> {
        self.blocks.iter().filter_map(|block| match block {
            DiffBlock::Hunk(hunk) => Some(hunk),
            _ => None,
        })
    }

    /// Lines a reviewer can attach a comment to, in display order.
    /// Deletions anchor to the old side; everything else to the new side.
    pub fn commentable_lines(&self) -> Vec<LineAnchor> {
        self.hunks()
            .flat_map(|hunk| hunk.changes.iter())
            .filter_map(DiffLine::anchor)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffBlock {
    Hunk(DiffHunk),
    Skip(SkipBlock),
    Opaque(OpaqueBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub header: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub changes: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipBlock {
    pub old_start: usize,
    pub new_start: usize,
    pub count: usize,
    pub label: String,
}

impl SkipBlock {
    fn new(old_start: usize, new_start: usize, count: usize) -> Self {
        let label = if count == 1 {
            "1 unchanged line".to_string()
        } else {
            format!("{} unchanged lines", count)
        };
        Self {
            old_start,
            new_start,
            count,
            label,
        }
    }
}

/// Region under a hunk header that could not be read. Shown as raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueBlock {
    pub header: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffLine {
    pub old_line_no: Option<usize>,
    pub new_line_no: Option<usize>,
    pub change_type: ChangeType,
    pub segments: Vec<Segment>,
    pub markup: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_newline_at_eof: bool,
}

impl DiffLine {
    pub fn content(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn anchor(&self) -> Option<LineAnchor> {
        match self.change_type {
            ChangeType::Removed => self.old_line_no.map(LineAnchor::left),
            ChangeType::Added | ChangeType::Context => self.new_line_no.map(LineAnchor::right),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Normal,
    Inserted,
    Deleted,
}

struct HunkHeader {
    old_start: usize,
    old_lines: usize,
    new_start: usize,
    new_lines: usize,
    section: Option<String>,
}

enum Section {
    Hunk {
        hunk: DiffHunk,
        old_end: usize,
        new_end: usize,
    },
    Opaque(OpaqueBlock),
}

pub struct DiffParser;

impl DiffParser {
    /// Parses the patch of a single file into hunks, skip blocks and opaque
    /// blocks. Missing or binary patches yield an empty block list.
    pub fn parse_patch(request: &ParseRequest, options: &ParseOptions) -> ParsedDiff {
        let mut parsed = ParsedDiff {
            filename: request.filename.clone(),
            previous_filename: request.previous_filename.clone(),
            content_hash: request.content_hash.clone(),
            blocks: Vec::new(),
        };

        let Some(patch) = request.patch.as_deref() else {
            return parsed;
        };
        if patch.trim().is_empty() || Self::is_binary(patch) {
            return parsed;
        }

        let lines: Vec<&str> = patch.lines().collect();
        let mut i = 0;
        while i < lines.len() && !lines[i].starts_with("@@") {
            i += 1;
        }

        let mut sections = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@") {
            let header = lines[i];
            match Self::parse_hunk_header(header) {
                Some(parsed_header) => sections.push(Self::parse_hunk(&lines, &mut i, parsed_header)),
                None => {
                    debug!(
                        "Malformed hunk header in {}: {:?}",
                        request.filename, header
                    );
                    sections.push(Section::Opaque(Self::parse_opaque(&lines, &mut i)));
                }
            }
        }

        parsed.blocks =
            Self::interleave_skip_blocks(sections, request.old_line_count, options.skip_threshold);
        parsed
    }

    /// Splits a multi-file unified diff (as printed by `git diff`) into one
    /// entry per file.
    pub fn split_unified_diff(diff_content: &str) -> Vec<ChangedFile> {
        let lines: Vec<&str> = diff_content.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            if lines[i].starts_with("diff --git") || Self::is_bare_file_header(&lines, i) {
                files.push(Self::split_single_file(&lines, &mut i));
            } else {
                i += 1;
            }
        }

        files
    }

    fn is_binary(patch: &str) -> bool {
        patch
            .lines()
            .take_while(|line| !line.starts_with("@@"))
            .any(|line| line.starts_with("Binary files") || line.starts_with("GIT binary patch"))
    }

    fn is_bare_file_header(lines: &[&str], i: usize) -> bool {
        lines[i].starts_with("--- ")
            && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "))
            && lines.get(i + 2).is_some_and(|l| l.starts_with("@@"))
    }

    fn split_single_file(lines: &[&str], i: &mut usize) -> ChangedFile {
        let mut old_path = None;
        let mut new_path = None;
        let mut rename_from = None;
        let mut rename_to = None;
        let mut status = FileStatus::Modified;
        let mut is_binary = false;

        if lines[*i].starts_with("diff --git") {
            if let Some((old, new)) = Self::git_header_paths(lines[*i]) {
                old_path = Some(old);
                new_path = Some(new);
            }
            *i += 1;
        }

        while *i < lines.len() && !lines[*i].starts_with("@@") && !lines[*i].starts_with("diff --git") {
            let line = lines[*i];
            if let Some(path) = line.strip_prefix("rename from ") {
                rename_from = Some(path.to_string());
            } else if let Some(path) = line.strip_prefix("rename to ") {
                rename_to = Some(path.to_string());
            } else if let Some(path) = line.strip_prefix("--- ") {
                match Self::header_path(path) {
                    Some(path) => old_path = Some(path),
                    None => status = FileStatus::Added,
                }
            } else if let Some(path) = line.strip_prefix("+++ ") {
                match Self::header_path(path) {
                    Some(path) => new_path = Some(path),
                    None => status = FileStatus::Removed,
                }
            } else if line.starts_with("new file mode") {
                status = FileStatus::Added;
            } else if line.starts_with("deleted file mode") {
                status = FileStatus::Removed;
            } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
                is_binary = true;
            }
            *i += 1;
        }

        // Bare `---`/`+++` pairs only start a new file once the current
        // hunk's line counts are used up.
        let body_start = *i;
        let (mut old_left, mut new_left) = (0usize, 0usize);
        while *i < lines.len() && !lines[*i].starts_with("diff --git") {
            let line = lines[*i];
            if old_left == 0 && new_left == 0 {
                if Self::is_bare_file_header(lines, *i) {
                    break;
                }
                if let Some(header) = Self::parse_hunk_header(line) {
                    old_left = header.old_lines;
                    new_left = header.new_lines;
                }
            } else {
                match line.chars().next() {
                    Some('+') => new_left = new_left.saturating_sub(1),
                    Some('-') => old_left = old_left.saturating_sub(1),
                    Some('\\') => {}
                    _ => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                }
            }
            *i += 1;
        }

        let previous_filename = if rename_from.is_some() || rename_to.is_some() {
            status = FileStatus::Renamed;
            rename_from.or_else(|| old_path.clone())
        } else {
            None
        };

        let filename = rename_to
            .or(if status == FileStatus::Removed { old_path.clone() } else { new_path })
            .or(old_path)
            .unwrap_or_default();

        let patch = if is_binary || body_start == *i {
            None
        } else {
            Some(lines[body_start..*i].join("\n"))
        };

        ChangedFile {
            filename,
            previous_filename,
            status,
            sha: None,
            patch,
        }
    }

    fn git_header_paths(line: &str) -> Option<(String, String)> {
        let rest = line.strip_prefix("diff --git ")?;
        let (old, new) = rest.split_once(" b/")?;
        Some((old.trim_start_matches("a/").to_string(), new.to_string()))
    }

    fn header_path(raw: &str) -> Option<String> {
        let path = raw.split('\t').next().unwrap_or(raw).trim();
        if path == "/dev/null" {
            return None;
        }
        Some(
            path.strip_prefix("a/")
                .or_else(|| path.strip_prefix("b/"))
                .unwrap_or(path)
                .to_string(),
        )
    }

    fn parse_hunk_header(header: &str) -> Option<HunkHeader> {
        let caps = HUNK_HEADER.captures(header)?;
        let number = |idx: usize, default: usize| -> Option<usize> {
            match caps.get(idx) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(default),
            }
        };

        let section = caps
            .get(5)
            .map(|m| m.as_str().trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Some(HunkHeader {
            old_start: number(1, 0)?,
            old_lines: number(2, 1)?,
            new_start: number(3, 0)?,
            new_lines: number(4, 1)?,
            section,
        })
    }

    fn parse_hunk(lines: &[&str], i: &mut usize, header: HunkHeader) -> Section {
        let header_text = lines[*i].to_string();
        *i += 1;

        let mut raw: Vec<(ChangeType, &str, Option<usize>, Option<usize>, bool)> = Vec::new();
        let mut old_line = first_line(header.old_start, header.old_lines);
        let mut new_line = first_line(header.new_start, header.new_lines);

        while *i < lines.len() && !lines[*i].starts_with("@@") && !lines[*i].starts_with("diff --git") {
            let line = lines[*i];
            *i += 1;

            if line.starts_with('\\') {
                if let Some(last) = raw.last_mut() {
                    last.4 = true;
                }
                continue;
            }

            match line.chars().next() {
                Some('+') => {
                    raw.push((ChangeType::Added, &line[1..], None, Some(new_line), false));
                    new_line += 1;
                }
                Some('-') => {
                    raw.push((ChangeType::Removed, &line[1..], Some(old_line), None, false));
                    old_line += 1;
                }
                Some(' ') => {
                    raw.push((ChangeType::Context, &line[1..], Some(old_line), Some(new_line), false));
                    old_line += 1;
                    new_line += 1;
                }
                _ => {
                    raw.push((ChangeType::Context, line, Some(old_line), Some(new_line), false));
                    old_line += 1;
                    new_line += 1;
                }
            }
        }

        let segments = Self::highlight(&raw);
        let changes = raw
            .into_iter()
            .zip(segments)
            .map(|((change_type, _, old_line_no, new_line_no, no_newline), segments)| DiffLine {
                old_line_no,
                new_line_no,
                change_type,
                markup: render_markup(&segments),
                segments,
                no_newline_at_eof: no_newline,
            })
            .collect();

        Section::Hunk {
            hunk: DiffHunk {
                old_start: header.old_start,
                old_lines: header.old_lines,
                new_start: header.new_start,
                new_lines: header.new_lines,
                header: header_text,
                section: header.section,
                changes,
            },
            old_end: old_line,
            new_end: new_line,
        }
    }

    fn parse_opaque(lines: &[&str], i: &mut usize) -> OpaqueBlock {
        let header = lines[*i].to_string();
        *i += 1;
        let mut body = Vec::new();
        while *i < lines.len() && !lines[*i].starts_with("@@") && !lines[*i].starts_with("diff --git") {
            body.push(lines[*i].to_string());
            *i += 1;
        }
        OpaqueBlock { header, lines: body }
    }

    /// Computes segments for every line. A run of deletions directly followed
    /// by a run of insertions is paired line by line and word-diffed.
    fn highlight(raw: &[(ChangeType, &str, Option<usize>, Option<usize>, bool)]) -> Vec<Vec<Segment>> {
        let mut out: Vec<Vec<Segment>> = raw
            .iter()
            .map(|(_, text, ..)| whole_line(text))
            .collect();

        let mut i = 0;
        while i < raw.len() {
            if raw[i].0 != ChangeType::Removed {
                i += 1;
                continue;
            }
            let removed_start = i;
            while i < raw.len() && raw[i].0 == ChangeType::Removed {
                i += 1;
            }
            let added_start = i;
            while i < raw.len() && raw[i].0 == ChangeType::Added {
                i += 1;
            }

            let pairs = (added_start - removed_start).min(i - added_start);
            for k in 0..pairs {
                let old = raw[removed_start + k].1;
                let new = raw[added_start + k].1;
                if old.len() + new.len() > MAX_INLINE_DIFF_LEN {
                    continue;
                }
                let (old_segments, new_segments) = word_segments(old, new);
                out[removed_start + k] = old_segments;
                out[added_start + k] = new_segments;
            }
        }

        out
    }

    /// Places skip blocks around and between hunks wherever the elided
    /// region is larger than `threshold`. Gaps next to opaque blocks are
    /// unknown and never produce a skip block.
    fn interleave_skip_blocks(
        sections: Vec<Section>,
        old_line_count: Option<usize>,
        threshold: usize,
    ) -> Vec<DiffBlock> {
        let mut blocks = Vec::with_capacity(sections.len() * 2);
        // (old_end, new_end) of the previous hunk; None before the first
        // section or after an opaque block.
        let mut previous: Option<(usize, usize)> = None;
        let mut first = true;

        for section in sections {
            match section {
                Section::Hunk {
                    hunk,
                    old_end,
                    new_end,
                } => {
                    let old_first = first_line(hunk.old_start, hunk.old_lines);
                    let gap = match previous {
                        Some((prev_old, prev_new)) => {
                            Some((prev_old, prev_new, old_first.saturating_sub(prev_old)))
                        }
                        None if first => Some((1, 1, old_first.saturating_sub(1))),
                        None => None,
                    };
                    if let Some((old_start, new_start, count)) = gap {
                        if count > threshold {
                            blocks.push(DiffBlock::Skip(SkipBlock::new(old_start, new_start, count)));
                        }
                    }
                    blocks.push(DiffBlock::Hunk(hunk));
                    previous = Some((old_end, new_end));
                }
                Section::Opaque(opaque) => {
                    blocks.push(DiffBlock::Opaque(opaque));
                    previous = None;
                }
            }
            first = false;
        }

        if let (Some((old_end, new_end)), Some(total)) = (previous, old_line_count) {
            let remaining = (total + 1).saturating_sub(old_end);
            if remaining > threshold {
                blocks.push(DiffBlock::Skip(SkipBlock::new(old_end, new_end, remaining)));
            }
        }

        blocks
    }
}

/// First line number covered by a hunk range. A zero-length range names
/// the line before the change, so the change itself starts one line later.
fn first_line(start: usize, count: usize) -> usize {
    if count == 0 {
        start + 1
    } else {
        start
    }
}

fn whole_line(text: &str) -> Vec<Segment> {
    vec![Segment {
        kind: SegmentKind::Normal,
        text: text.to_string(),
    }]
}

fn push_segment(segments: &mut Vec<Segment>, kind: SegmentKind, text: &str) {
    if text.is_empty() {
        return;
    }
    match segments.last_mut() {
        Some(last) if last.kind == kind => last.text.push_str(text),
        _ => segments.push(Segment {
            kind,
            text: text.to_string(),
        }),
    }
}

fn word_segments(old: &str, new: &str) -> (Vec<Segment>, Vec<Segment>) {
    let diff = TextDiff::from_words(old, new);
    let mut old_segments = Vec::new();
    let mut new_segments = Vec::new();

    for change in diff.iter_all_changes() {
        let text = change.value();
        match change.tag() {
            ChangeTag::Equal => {
                push_segment(&mut old_segments, SegmentKind::Normal, text);
                push_segment(&mut new_segments, SegmentKind::Normal, text);
            }
            ChangeTag::Delete => push_segment(&mut old_segments, SegmentKind::Deleted, text),
            ChangeTag::Insert => push_segment(&mut new_segments, SegmentKind::Inserted, text),
        }
    }

    if old_segments.is_empty() {
        old_segments = whole_line(old);
    }
    if new_segments.is_empty() {
        new_segments = whole_line(new);
    }
    (old_segments, new_segments)
}

fn render_markup(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        let text = escape_html(&segment.text);
        match segment.kind {
            SegmentKind::Normal => out.push_str(&text),
            SegmentKind::Inserted => {
                out.push_str("<ins>");
                out.push_str(&text);
                out.push_str("</ins>");
            }
            SegmentKind::Deleted => {
                out.push_str("<del>");
                out.push_str(&text);
                out.push_str("</del>");
            }
        }
    }
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
