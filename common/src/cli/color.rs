//! ANSI color policy for log output.
//!
//! - Command-line choice wins.
//! - `NO_COLOR` disables colors.
//! - `EMACS` implies non-interactive output.
//! - In `Auto`, only enable colors when the target stream is a TTY.

use std::env;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

/// Snapshot of the environment inputs the policy depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Terminal {
    no_color: bool,
    emacs: bool,
    is_tty: bool,
}

impl Terminal {
    // ---
    fn detect(stream: atty::Stream) -> Self {
        // ---
        Self {
            no_color: env::var_os("NO_COLOR").is_some(),
            emacs: env::var_os("EMACS").is_some(),
            is_tty: atty::is(stream),
        }
    }
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        self.resolve(Terminal::detect(stream))
    }

    /// Log output goes to stderr.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }

    fn resolve(self, term: Terminal) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !term.no_color && !term.emacs && term.is_tty,
        }
    }
}
