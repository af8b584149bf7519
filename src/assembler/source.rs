//! Source loading and `.include` resolution.
//!
//! Produces the numbered, provenance-stamped [`Line`]s every later pass
//! reports against. Included files are wrapped in local-block sentinels so
//! their `$`-labels never collide with the including file's.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

static INCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.include\s+<?([^<>\s]+)>?\s*$").unwrap());

/// A single trimmed source line with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    /// Originating file name; empty for the root text.
    pub file: Arc<str>,
    /// 1-based line number within `file`.
    pub number: usize,
    /// Line number of the `.include` or macro invocation this line was
    /// produced by, if any.
    pub included_by: Option<usize>,
    pub text: String,
}

impl Line {
    pub fn new<F: Into<Arc<str>>, T: Into<String>>(file: F, number: usize, text: T) -> Self {
        Line {
            file: file.into(),
            number,
            included_by: None,
            text: text.into(),
        }
    }

    /// Produces a copy of this line holding different text. The preprocessor
    /// uses this instead of mutating in place.
    pub fn with_text<T: Into<String>>(&self, text: T) -> Self {
        Line {
            file: self.file.clone(),
            number: self.number,
            included_by: self.included_by,
            text: text.into(),
        }
    }

    pub fn location(&self) -> String {
        let file = if self.file.is_empty() {
            "<input>"
        } else {
            &self.file
        };
        match self.included_by {
            Some(parent) => format!("{}:{} (via line {})", file, self.number, parent),
            None => format!("{}:{}", file, self.number),
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Splits the root text into [`Line`]s, resolving `.include` directives
/// against `dir`.
///
/// A path already on the active include stack is skipped entirely; a missing
/// file becomes a `!!!` marker line the tokenizer reports as a diagnostic.
pub fn load(text: &str, dir: Option<&Path>) -> Vec<Line> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = Vec::new();
    load_text(text, Arc::from(""), dir, None, &mut stack, &mut out);
    out
}

fn load_text(
    text: &str,
    file: Arc<str>,
    dir: Option<&Path>,
    included_by: Option<usize>,
    stack: &mut Vec<PathBuf>,
    out: &mut Vec<Line>,
) {
    for (index, raw) in text.lines().enumerate() {
        let mut line = Line::new(file.clone(), index + 1, raw.trim());
        line.included_by = included_by;

        if let Some(cap) = INCLUDE.captures(&line.text) {
            include(&cap[1], dir, &line, stack, out);
        } else {
            out.push(line);
        }
    }
}

fn include(path: &str, dir: Option<&Path>, from: &Line, stack: &mut Vec<PathBuf>, out: &mut Vec<Line>) {
    let resolved = match dir {
        Some(dir) => dir.join(path),
        None => PathBuf::from(path),
    };

    // Silent cycle suppression: a file currently being included contributes
    // nothing when it names itself again.
    if stack.contains(&resolved) {
        return;
    }

    let text = match fs::read_to_string(&resolved) {
        Ok(text) => text,
        Err(_) => {
            out.push(from.with_text(format!("!!!File '{path}' not found")));
            return;
        }
    };

    out.push(from.with_text(".push_locblk"));
    out.push(from.with_text(".dbgbrk"));

    stack.push(resolved.clone());
    let child_dir = resolved.parent().map(|p| p.to_path_buf());
    load_text(
        &text,
        Arc::from(path),
        child_dir.as_deref(),
        Some(from.number),
        stack,
        out,
    );
    stack.pop();

    out.push(from.with_text(".dbgbrk"));
    out.push(from.with_text(".pop_locblk"));
}
