//! Diagnostic sink and rendering.
//!
//! Syntax and semantic errors accumulate here, up to a configurable
//! limit, so one compile reports several issues. Rendering goes through
//! codespan-reporting: source path, 1-based line/column, a caret
//! underline on the offending span, and a one-line suggestion when the
//! producer attached one. Color only when stderr is a terminal.

use crate::token::Span;
use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files::SimpleFile;
use codespan_reporting::term;
use std::io::IsTerminal;
use termcolor::{ColorChoice, StandardStream};

/// Which family a diagnostic belongs to (spec-level taxonomy; codegen
/// and internal errors abort instead of accumulating).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    Syntax,
    Semantic,
}

/// One collected diagnostic.
#[derive(Debug, Clone)]
pub struct Diag {
    pub kind: DiagKind,
    pub message: String,
    pub span: Span,
    pub suggestion: Option<String>,
}

/// Collects user-facing errors up to a limit.
#[derive(Debug)]
pub struct ErrorSink {
    diags: Vec<Diag>,
    limit: usize,
    /// Errors dropped after the limit was reached.
    suppressed: usize,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ErrorSink {
    pub fn new(limit: usize) -> Self {
        Self {
            diags: Vec::new(),
            limit,
            suppressed: 0,
        }
    }

    pub fn push(&mut self, diag: Diag) {
        if self.diags.len() < self.limit {
            self.diags.push(diag);
        } else {
            self.suppressed += 1;
        }
    }

    pub fn error(&mut self, kind: DiagKind, span: Span, message: impl Into<String>) {
        self.push(Diag {
            kind,
            message: message.into(),
            span,
            suggestion: None,
        });
    }

    pub fn error_with_suggestion(
        &mut self,
        kind: DiagKind,
        span: Span,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) {
        self.push(Diag {
            kind,
            message: message.into(),
            span,
            suggestion: Some(suggestion.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.diags.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.diags.len()
    }

    pub fn diags(&self) -> &[Diag] {
        &self.diags
    }

    /// Render every diagnostic to stderr with caret context.
    pub fn render(&self, path: &str, source: &str) {
        let file = SimpleFile::new(path, source);
        let choice = if std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
        {
            ColorChoice::Auto
        } else {
            ColorChoice::Never
        };
        let writer = StandardStream::stderr(choice);
        let config = term::Config::default();
        for diag in &self.diags {
            let mut label = Label::primary((), diag.span.start..diag.span.end.max(diag.span.start + 1));
            label.message = diag.message.clone();
            let mut rendered = Diagnostic::error()
                .with_message(diag.message.clone())
                .with_labels(vec![label]);
            if let Some(s) = &diag.suggestion {
                rendered = rendered.with_notes(vec![s.clone()]);
            }
            let _ = term::emit(&mut writer.lock(), &config, &file, &rendered);
        }
        if self.suppressed > 0 {
            eprintln!(
                "... and {} more error{} not shown",
                self.suppressed,
                if self.suppressed == 1 { "" } else { "s" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_suppresses() {
        let mut sink = ErrorSink::new(2);
        for i in 0..5 {
            sink.error(DiagKind::Semantic, Span::new(i, i + 1), format!("e{i}"));
        }
        assert_eq!(sink.len(), 2);
        assert!(sink.is_full());
        assert_eq!(sink.suppressed, 3);
    }

    #[test]
    fn test_default_limit_is_ten() {
        let sink = ErrorSink::default();
        assert_eq!(sink.limit, 10);
    }
}
