//! Style constants for the `orc` REPL's terminal output.

use anstyle::{AnsiColor, Effects, Style};

/// Green — success messages.
pub(crate) const SUCCESS: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Green)));

/// Red — errors.
pub(crate) const ERROR: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Red)));

/// Yellow — warnings (e.g. `tag` writes not yet reflected by the collector).
pub(crate) const WARNING: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Yellow)));

/// Bold — section headers.
pub(crate) const HEADER: Style = Style::new().effects(Effects::BOLD);

/// Dimmed — secondary/muted information.
pub(crate) const DIM: Style = Style::new().effects(Effects::DIMMED);
