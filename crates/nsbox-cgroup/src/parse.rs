//! Strict decimal parsing for kernel accounting files

use log::warn;
use std::fmt;
use std::path::Path;

/// Why a value could not be parsed. Kernel accounting formats are stable,
/// so each failure cause points at a different kind of breakage and is
/// worth telling apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailure {
    Empty,
    NoDigits,
    TrailingGarbage,
    OutOfRange,
    Negative,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseFailure::Empty => "empty input",
            ParseFailure::NoDigits => "no numerical digits",
            ParseFailure::TrailingGarbage => "trailing non-numeric characters",
            ParseFailure::OutOfRange => "value out of range",
            ParseFailure::Negative => "negative value",
        };
        f.write_str(msg)
    }
}

/// Parse one non-negative decimal integer: optional leading whitespace,
/// an optional sign, a digit run, then at most trailing whitespace.
pub fn parse_non_negative(input: &str) -> Result<i64, ParseFailure> {
    if input.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let s = input.trim_start();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let digits_len = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits_len == 0 {
        return Err(ParseFailure::NoDigits);
    }
    if !s[digits_len..].trim_end().is_empty() {
        return Err(ParseFailure::TrailingGarbage);
    }

    let magnitude: i64 = s[..digits_len]
        .parse()
        .map_err(|_| ParseFailure::OutOfRange)?;
    if negative {
        return Err(ParseFailure::Negative);
    }
    Ok(magnitude)
}

/// Parse a value read from an accounting file, mapping malformed content
/// to -1 with a warning that names the file.
pub fn decimal_or_warn(content: &str, what: &str, path: &Path) -> i64 {
    match parse_non_negative(content) {
        Ok(value) => value,
        Err(cause) => {
            let prefix: String = content.chars().take(20).collect();
            warn!(
                "could not parse {} from '{}': {} (content starts with {:?})",
                what,
                path.display(),
                cause,
                prefix
            );
            -1
        }
    }
}
