use std::collections::VecDeque;

use serde::Serialize;

use crate::phase::Phase;

/// Lines kept for display; older output is dropped first.
pub const MAX_OUTPUT_LINES: usize = 2_000;

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The container runtime refused or the container died. The message
    /// already carries runtime-specific guidance.
    Container,
    /// A pull/build subprocess or an internal step failed.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn container(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Container,
            message: message.into(),
        }
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Command,
            message: message.into(),
        }
    }

    /// Text shown to the user. Only non-container failures get the generic
    /// remediation hint.
    pub fn display_text(&self) -> String {
        match self.kind {
            FailureKind::Container => self.message.clone(),
            FailureKind::Command => format!(
                "{}\n\nCheck the output above for details, then retry or restart berth.",
                self.message
            ),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_text())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything the user sees about one bootstrap run. Owned by the
/// orchestrator actor; readers never touch it directly.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub phase: Phase,
    pub status_text: String,
    output: VecDeque<String>,
    pub completed: bool,
    pub failure: Option<Failure>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            status_text: String::new(),
            output: VecDeque::new(),
            completed: false,
            failure: None,
        }
    }

    pub fn set_phase(&mut self, phase: Phase, status_text: impl Into<String>) {
        self.phase = phase;
        self.status_text = status_text.into();
    }

    pub fn push_output(&mut self, line: impl Into<String>) {
        if self.output.len() == MAX_OUTPUT_LINES {
            self.output.pop_front();
        }
        self.output.push_back(line.into());
    }

    pub fn output(&self) -> impl Iterator<Item = &str> {
        self.output.iter().map(String::as_str)
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn fail(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_hint_only_for_command_failures() {
        let container = Failure::container("port 6369 is already in use");
        assert_eq!(container.display_text(), "port 6369 is already in use");

        let command = Failure::command("pull failed");
        let text = command.display_text();
        assert!(text.starts_with("pull failed"));
        assert!(text.contains("retry or restart berth"));
    }

    #[test]
    fn output_is_bounded_and_ordered() {
        let mut session = Session::new();
        for i in 0..MAX_OUTPUT_LINES + 3 {
            session.push_output(format!("line {i}"));
        }
        assert_eq!(session.output_len(), MAX_OUTPUT_LINES);
        assert_eq!(session.output().next(), Some("line 3"));
        assert_eq!(
            session.output().last().map(str::to_string),
            Some(format!("line {}", MAX_OUTPUT_LINES + 2))
        );
    }

    #[test]
    fn failure_marks_session() {
        let mut session = Session::new();
        assert!(!session.is_failed());
        session.fail(Failure::command("boom"));
        assert!(session.is_failed());
        assert!(!session.completed);
    }
}
