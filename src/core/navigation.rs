use tracing::debug;

use crate::core::diff_parser::{LineAnchor, Side};
use crate::core::pending::{CommentTarget, PendingComment, PendingReview, ReviewError};

const MAX_GOTO_DIGITS: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavState {
    Idle,
    Focused(LineAnchor),
    Range {
        anchor: LineAnchor,
        focus: LineAnchor,
    },
    GotoInput {
        buffer: String,
        prior: Box<NavState>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    Down,
    Up,
    ExtendDown,
    ExtendUp,
    EnterGoto,
    Digit(u8),
    Backspace,
    Confirm,
    Cancel,
}

impl NavAction {
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'j' => Some(NavAction::Down),
            'k' => Some(NavAction::Up),
            'J' => Some(NavAction::ExtendDown),
            'K' => Some(NavAction::ExtendUp),
            'g' => Some(NavAction::EnterGoto),
            '0'..='9' => key.to_digit(10).map(|d| NavAction::Digit(d as u8)),
            '\n' | '\r' => Some(NavAction::Confirm),
            '\u{1b}' => Some(NavAction::Cancel),
            '\u{8}' | '\u{7f}' => Some(NavAction::Backspace),
            _ => None,
        }
    }
}

/// Keyboard focus and selection over the commentable lines of one file.
///
/// Transitions only change data; scrolling and highlighting are left to
/// whoever renders the state.
#[derive(Debug, Clone)]
pub struct LineNavigator {
    lines: Vec<LineAnchor>,
    state: NavState,
}

impl LineNavigator {
    pub fn new(lines: Vec<LineAnchor>) -> Self {
        Self {
            lines,
            state: NavState::Idle,
        }
    }

    /// Switches to another file's lines. Always returns to `Idle`.
    pub fn select_file(&mut self, lines: Vec<LineAnchor>) {
        self.lines = lines;
        self.state = NavState::Idle;
    }

    pub fn reset(&mut self) {
        self.state = NavState::Idle;
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    pub fn lines(&self) -> &[LineAnchor] {
        &self.lines
    }

    pub fn focus(&self) -> Option<LineAnchor> {
        match &self.state {
            NavState::Focused(focus) | NavState::Range { focus, .. } => Some(*focus),
            _ => None,
        }
    }

    pub fn anchor(&self) -> Option<LineAnchor> {
        match &self.state {
            NavState::Range { anchor, .. } => Some(*anchor),
            _ => None,
        }
    }

    /// The selected lines in display order.
    pub fn selection(&self) -> Vec<LineAnchor> {
        match &self.state {
            NavState::Focused(focus) => vec![*focus],
            NavState::Range { anchor, focus } => {
                match (self.index_of(*anchor), self.index_of(*focus)) {
                    (Some(a), Some(f)) => self.lines[a.min(f)..=a.max(f)].to_vec(),
                    _ => vec![*focus],
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn apply(&mut self, action: NavAction) -> &NavState {
        if let NavState::GotoInput { .. } = self.state {
            self.apply_goto(action);
        } else {
            match action {
                NavAction::Down => self.move_focus(true, false),
                NavAction::Up => self.move_focus(false, false),
                NavAction::ExtendDown => self.move_focus(true, true),
                NavAction::ExtendUp => self.move_focus(false, true),
                NavAction::EnterGoto => {
                    let prior = std::mem::replace(&mut self.state, NavState::Idle);
                    self.state = NavState::GotoInput {
                        buffer: String::new(),
                        prior: Box::new(prior),
                    };
                }
                NavAction::Cancel => self.state = NavState::Idle,
                NavAction::Digit(_) | NavAction::Backspace | NavAction::Confirm => {}
            }
        }
        &self.state
    }

    /// Opens a composer for the focused line or range. The target line is the
    /// focus; a range on one side also carries its lower line as start line.
    pub fn start_comment(&self) -> Option<Composer> {
        let target = match &self.state {
            NavState::Focused(focus) => CommentTarget::line(*focus),
            NavState::Range { anchor, focus } => CommentTarget {
                anchor: *focus,
                start_line: (anchor.side == focus.side).then(|| anchor.line.min(focus.line)),
            },
            _ => return None,
        };
        Some(Composer {
            target,
            body: String::new(),
        })
    }

    fn index_of(&self, line: LineAnchor) -> Option<usize> {
        self.lines.iter().position(|l| *l == line)
    }

    fn step(&self, from: Option<LineAnchor>, forward: bool) -> Option<LineAnchor> {
        let last = self.lines.len().checked_sub(1)?;
        let index = match from.and_then(|line| self.index_of(line)) {
            Some(i) if forward => (i + 1).min(last),
            Some(i) => i.saturating_sub(1),
            None if forward => 0,
            None => last,
        };
        Some(self.lines[index])
    }

    fn move_focus(&mut self, forward: bool, extend: bool) {
        let (anchor, focus) = match &self.state {
            NavState::Idle => (None, None),
            NavState::Focused(focus) => (None, Some(*focus)),
            NavState::Range { anchor, focus } => (Some(*anchor), Some(*focus)),
            NavState::GotoInput { .. } => return,
        };
        let Some(next) = self.step(focus, forward) else {
            return;
        };

        self.state = match anchor.or(focus) {
            Some(anchor) if extend && anchor != next => NavState::Range { anchor, focus: next },
            _ => NavState::Focused(next),
        };
    }

    fn apply_goto(&mut self, action: NavAction) {
        let NavState::GotoInput { buffer, prior } = &mut self.state else {
            return;
        };
        match action {
            NavAction::Digit(d) if d <= 9 => {
                if buffer.len() < MAX_GOTO_DIGITS {
                    buffer.push(char::from(b'0' + d));
                }
            }
            NavAction::Backspace => {
                buffer.pop();
            }
            NavAction::Cancel => {
                self.state = std::mem::replace(prior.as_mut(), NavState::Idle);
            }
            NavAction::Confirm => {
                let target = buffer.parse::<usize>().ok().and_then(|n| nearest(&self.lines, n));
                self.state = match target {
                    Some(line) => {
                        debug!("Goto resolved to line {}", line.line);
                        NavState::Focused(line)
                    }
                    None => std::mem::replace(prior.as_mut(), NavState::Idle),
                };
            }
            _ => {}
        }
    }
}

/// Commentable line closest to `target`; the lower line wins a tie and
/// the new side wins when both sides carry the same number.
fn nearest(lines: &[LineAnchor], target: usize) -> Option<LineAnchor> {
    lines
        .iter()
        .copied()
        .min_by_key(|l| (l.line.abs_diff(target), l.line, l.side == Side::Left))
}

/// An inline comment being written for a target line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composer {
    target: CommentTarget,
    body: String,
}

impl Composer {
    pub fn target(&self) -> CommentTarget {
        self.target
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Turns the composer into a draft and returns navigation to `Idle`.
    /// On error the composer and navigation are left untouched.
    pub fn submit(
        &self,
        path: &str,
        review: &mut PendingReview,
        navigator: &mut LineNavigator,
    ) -> Result<PendingComment, ReviewError> {
        let draft = review.add_draft_at(path, self.target, &self.body)?;
        navigator.reset();
        Ok(draft)
    }
}
