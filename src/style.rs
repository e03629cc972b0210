//! Terminal styling for user-facing output.

use crossterm::style::Stylize;

/// Applies ANSI styles to output lines when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    enabled: bool,
}

impl Default for Palette {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Palette {
    /// Creates a palette; a disabled palette returns text unchanged.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Palette that never emits escape codes.
    #[must_use]
    pub fn plain() -> Self {
        Self::new(false)
    }

    /// Returns true if styles are applied.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint(text, |t| t.dim().to_string())
    }

    pub fn green(&self, text: &str) -> String {
        self.paint(text, |t| t.green().to_string())
    }

    pub fn cyan(&self, text: &str) -> String {
        self.paint(text, |t| t.cyan().bold().to_string())
    }

    pub fn blue(&self, text: &str) -> String {
        self.paint(text, |t| t.blue().to_string())
    }

    pub fn red(&self, text: &str) -> String {
        self.paint(text, |t| t.red().bold().to_string())
    }

    pub fn magenta_dim(&self, text: &str) -> String {
        self.paint(text, |t| t.magenta().bold().dim().to_string())
    }

    fn paint(&self, text: &str, style: impl FnOnce(String) -> String) -> String {
        if self.enabled {
            style(text.to_string())
        } else {
            text.to_string()
        }
    }
}
