//! Colored terminal output for the CLI.
//!
//! Uses `termcolor` for cross-platform colored output; color is
//! auto-detected and `NO_COLOR` is respected. Diagnostics with carets
//! render elsewhere (the codespan-based sink); this is for the CLI's
//! own status lines.

use std::io::{IsTerminal, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolve the color choice for stderr.
pub fn stderr_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stderr().is_terminal() {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

/// Styled stderr writer for status and error lines.
pub struct StyledErr {
    stream: StandardStream,
}

impl StyledErr {
    pub fn new() -> Self {
        Self {
            stream: StandardStream::stderr(stderr_choice()),
        }
    }

    fn styled(&mut self, prefix: &str, color: Color, message: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(color)).set_bold(true);
        let _ = self.stream.set_color(&spec);
        let _ = write!(self.stream, "{prefix}");
        let _ = self.stream.reset();
        let _ = writeln!(self.stream, " {message}");
    }

    /// Red fatal-error line.
    pub fn error(&mut self, message: &str) {
        self.styled("error:", Color::Red, message);
    }

    /// Cyan progress line (`--verbose`).
    pub fn note(&mut self, message: &str) {
        self.styled("note:", Color::Cyan, message);
    }

    /// Yellow warning line.
    pub fn warn(&mut self, message: &str) {
        self.styled("warning:", Color::Yellow, message);
    }
}

impl Default for StyledErr {
    fn default() -> Self {
        Self::new()
    }
}
