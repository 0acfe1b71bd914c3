//! Checklist line parser.
//!
//! Turns one line of document text into a [`ParsedLine`] when it is a
//! checklist item, and renders task records back into lines. Everything here
//! is pure: no I/O, no state, and every input string yields either a record
//! or `None`.
//!
//! ```text
//!   - [x] Call Bob ^t12
//!   ^ ^  ^  ^        ^
//!   | |  |  text     block identifier (optional, trailing)
//!   | |  status: ' ' open, 'x'/'X' done
//!   | marker: '-' or '*'
//!   indentation
//! ```

use regex::Regex;
use std::sync::LazyLock;

/// Accepts blockquote/callout prefixes and any single status character.
static GENERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*(?:>[ \t]*)*)(?P<marker>[-*])[ \t]+\[(?P<status>[^\]])\](?:[ \t]+(?P<body>.*))?$")
        .expect("general checklist pattern is valid")
});

/// Marker at line start modulo indentation; status must be blank, `x` or `X`.
static STRICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)(?P<marker>[-*])[ \t]+\[(?P<status>[ xX])\](?:[ \t]+(?P<body>.*))?$")
        .expect("strict checklist pattern is valid")
});

static TRAILING_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[ \t]+)\^(?P<id>[A-Za-z0-9-]+)[ \t]*$").expect("block id pattern is valid")
});

/// A checklist line broken into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Everything before the list marker (whitespace, blockquote markers).
    pub indent: String,
    pub marker: char,
    pub complete: bool,
    /// Trimmed display text, without the trailing block identifier.
    pub text: String,
    /// Trailing `^identifier` body, without the caret.
    pub block_id: Option<String>,
}

impl ParsedLine {
    /// Renders the line back to text in canonical spacing.
    pub fn render(&self) -> String {
        render_line(
            &self.indent,
            self.marker,
            self.complete,
            &self.text,
            self.block_id.as_deref(),
        )
    }
}

/// Parses with the general pattern.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    parse_with(&GENERAL, line, false)
}

/// Parses with the strict pattern, which also rejects carets in the body.
pub fn parse_line_strict(line: &str) -> Option<ParsedLine> {
    parse_with(&STRICT, line, true)
}

/// Chooses between the general and strict patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParser {
    pub strict: bool,
}

impl LineParser {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn parse(&self, line: &str) -> Option<ParsedLine> {
        if self.strict {
            parse_line_strict(line)
        } else {
            parse_line(line)
        }
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(true)
    }
}

fn parse_with(pattern: &Regex, line: &str, strict: bool) -> Option<ParsedLine> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let caps = pattern.captures(line)?;

    let status = caps.name("status")?.as_str().chars().next()?;
    let marker = caps.name("marker")?.as_str().chars().next()?;
    let body = caps.name("body").map(|m| m.as_str()).unwrap_or("");

    let (text, block_id) = match TRAILING_ID.captures(body) {
        Some(id_caps) => {
            let whole = id_caps.get(0)?;
            (
                body[..whole.start()].trim(),
                Some(id_caps.name("id")?.as_str().to_string()),
            )
        }
        None => (body.trim(), None),
    };

    if text.is_empty() {
        return None;
    }
    if strict && text.contains('^') {
        return None;
    }

    Some(ParsedLine {
        indent: caps.name("indent")?.as_str().to_string(),
        marker,
        complete: matches!(status, 'x' | 'X'),
        text: text.to_string(),
        block_id,
    })
}

/// Renders a checklist line.
pub fn render_line(
    indent: &str,
    marker: char,
    complete: bool,
    text: &str,
    block_id: Option<&str>,
) -> String {
    let status = if complete { 'x' } else { ' ' };
    match block_id {
        Some(id) => format!("{}{} [{}] {} ^{}", indent, marker, status, text.trim(), id),
        None => format!("{}{} [{}] {}", indent, marker, status, text.trim()),
    }
}

/// Sets the trailing block identifier of `line`, replacing an existing one
/// or appending ` ^<block_id>`. The rest of the line is left as it was.
pub fn with_block_id(line: &str, block_id: &str) -> String {
    let line = line.strip_suffix('\r').unwrap_or(line);
    match TRAILING_ID.find(line) {
        Some(m) if m.start() > 0 => format!("{} ^{}", &line[..m.start()], block_id),
        _ => format!("{} ^{}", line.trim_end(), block_id),
    }
}
