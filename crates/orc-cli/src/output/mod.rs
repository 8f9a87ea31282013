//! Styled terminal output for the `orc` REPL. Uses `anstyle` for ANSI
//! style definitions and `anstream` for auto-detecting terminal
//! capabilities, degrading to plain text when piped.

mod styles;

use std::io::Write;
use styles::{DIM, ERROR, HEADER, SUCCESS, WARNING};

pub fn success(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{SUCCESS}{msg}{SUCCESS:#}").ok();
}

pub fn error(msg: impl std::fmt::Display) {
    let mut out = anstream::stderr().lock();
    writeln!(out, "{ERROR}{msg}{ERROR:#}").ok();
}

pub fn warning(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{WARNING}{msg}{WARNING:#}").ok();
}

pub fn header(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{HEADER}{msg}{HEADER:#}").ok();
}

pub fn dim(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{DIM}{msg}{DIM:#}").ok();
}

pub fn plain(msg: impl std::fmt::Display) {
    let mut out = anstream::stdout().lock();
    writeln!(out, "{msg}").ok();
}
