//! Textual preprocessing: `.define` substitution and macro expansion.
//!
//! Both passes produce fresh [`Line`]s; the loader's output is never
//! mutated. Macro expansion runs to a fixed point with a hard cap so
//! mutually-recursive macros terminate with a diagnostic instead of
//! diverging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::source::Line;
use super::Errors;
use crate::diagnostic::Diagnostic;
use crate::spanned_error;

/// Full passes the expander may take before declaring recursion.
const EXPANSION_LIMIT: usize = 128;

/// When armed, hitting [`EXPANSION_LIMIT`] fails the whole assembly instead
/// of degrading the offending lines to `nop`. Tests arm this to assert on
/// recursion detection deterministically.
static PANIC_ON_RECURSION: AtomicBool = AtomicBool::new(false);

pub fn set_panic_on_recursion(enabled: bool) {
    PANIC_ON_RECURSION.store(enabled, Ordering::SeqCst);
}

/// Serializes tests that observe [`PANIC_ON_RECURSION`]; the flag is
/// process-wide and the test harness is not.
#[cfg(test)]
pub(crate) static RECURSION_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn recursion_guard() -> std::sync::MutexGuard<'static, ()> {
    RECURSION_GUARD
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

static DEFINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\.define\s+"(.*)",?\s*([A-Za-z_][A-Za-z0-9_]*)$"#).unwrap());
static MACRO_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.macro\s+([A-Za-z_][A-Za-z0-9_]*)\(([^)]*)\)$").unwrap());
static INVOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\((.*)\)$").unwrap());
static ARG_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*").unwrap());

#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    pub params: Vec<String>,
    pub lines: Vec<Line>,
}

/// Lookup key: macros overload on name *and* arity.
type MacroKey = (String, usize);

pub fn preprocess(lines: Vec<Line>, errors: &mut Errors) -> Result<Vec<Line>, Errors> {
    let defined = apply_defines(lines, errors);
    let (macros, remaining) = collect_macros(defined, errors);
    expand_macros(remaining, &macros, errors)
}

/// Installs `.define "value" NAME` lines and substitutes `[NAME]` in every
/// remaining line.
fn apply_defines(lines: Vec<Line>, errors: &mut Errors) -> Vec<Line> {
    let mut defines: HashMap<String, String> = HashMap::new();
    let mut kept = Vec::with_capacity(lines.len());

    for line in lines {
        if let Some(cap) = DEFINE.captures(&line.text) {
            if defines.insert(cap[2].to_owned(), cap[1].to_owned()).is_some() {
                Diagnostic::warning(format!("redefining `{}`", &cap[2])).emit();
            }
        } else if line.text.starts_with(".define") {
            errors.push(spanned_error!(line, "malformed `.define` directive")
                .with_help("expected `.define \"<value>\" <NAME>`"));
        } else {
            kept.push(line);
        }
    }

    if defines.is_empty() {
        return kept;
    }

    kept.into_iter()
        .map(|line| {
            let mut text = line.text.clone();
            for (name, value) in &defines {
                let needle = format!("[{name}]");
                if text.contains(&needle) {
                    text = text.replace(&needle, value);
                }
            }
            if text == line.text {
                line
            } else {
                line.with_text(text)
            }
        })
        .collect()
}

/// Pulls `.macro` … `.endmacro` blocks out of the line list.
fn collect_macros(lines: Vec<Line>, errors: &mut Errors) -> (HashMap<MacroKey, Macro>, Vec<Line>) {
    let mut macros = HashMap::new();
    let mut kept = Vec::with_capacity(lines.len());
    let mut current: Option<(Line, Macro)> = None;

    for line in lines {
        if let Some(cap) = MACRO_OPEN.captures(&line.text) {
            if current.is_some() {
                errors.push(spanned_error!(line, "macro definitions cannot be nested"));
                continue;
            }
            let params = split_params(&cap[2]);
            current = Some((
                line.clone(),
                Macro {
                    name: cap[1].to_owned(),
                    params,
                    lines: Vec::new(),
                },
            ));
        } else if line.text == ".endmacro" {
            match current.take() {
                Some((_, mac)) => {
                    macros.insert((mac.name.clone(), mac.params.len()), mac);
                }
                None => errors.push(spanned_error!(line, "`.endmacro` without a matching `.macro`")),
            }
        } else if let Some((_, mac)) = current.as_mut() {
            // Body lines carry the macro name as their origin file.
            let mut stored = line.clone();
            stored.file = Arc::from(format!("macro {}", mac.name));
            mac.lines.push(stored);
        } else {
            kept.push(line);
        }
    }

    if let Some((open, mac)) = current {
        errors.push(
            spanned_error!(open, "unclosed macro definition `{}`", mac.name)
                .with_help("add a matching `.endmacro`"),
        );
    }

    (macros, kept)
}

fn split_params(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        Vec::new()
    } else {
        ARG_SPLIT.split(raw.trim()).map(|p| p.trim().to_owned()).collect()
    }
}

/// Rewrites macro invocations until a full pass makes no change.
fn expand_macros(
    mut lines: Vec<Line>,
    macros: &HashMap<MacroKey, Macro>,
    errors: &mut Errors,
) -> Result<Vec<Line>, Errors> {
    for _ in 0..EXPANSION_LIMIT {
        let (expanded, changed) = expansion_pass(lines, macros, errors);
        lines = expanded;
        if !changed {
            return Ok(lines);
        }
    }

    // Anything still holding a known invocation is recursing.
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        if invocation_of(&line, macros).is_some() {
            let err = spanned_error!(line.clone(), "macro recursion limit reached")
                .with_help("macros may not expand themselves, directly or indirectly");
            if PANIC_ON_RECURSION.load(Ordering::SeqCst) {
                return Err(vec![err]);
            }
            errors.push(err);
            out.push(line.with_text("nop"));
        } else {
            out.push(line);
        }
    }
    Ok(out)
}

fn invocation_of<'a>(line: &Line, macros: &'a HashMap<MacroKey, Macro>) -> Option<(&'a Macro, Vec<String>)> {
    let cap = INVOCATION.captures(&line.text)?;
    let args = split_params(&cap[2]);
    macros
        .get(&(cap[1].to_owned(), args.len()))
        .map(|mac| (mac, args))
}

fn expansion_pass(
    lines: Vec<Line>,
    macros: &HashMap<MacroKey, Macro>,
    errors: &mut Errors,
) -> (Vec<Line>, bool) {
    let mut out = Vec::with_capacity(lines.len());
    let mut changed = false;

    for line in lines {
        let Some(cap) = INVOCATION.captures(&line.text) else {
            out.push(line);
            continue;
        };
        let args = split_params(&cap[2]);

        match macros.get(&(cap[1].to_owned(), args.len())) {
            Some(mac) => {
                changed = true;
                out.push(line.with_text(".push_locblk"));
                out.push(line.with_text(".dbgbrk"));
                out.push(line.with_text(format!(";!! Macro invocation: {}", line.text)));
                for body in &mac.lines {
                    let mut text = body.text.clone();
                    for (param, arg) in mac.params.iter().zip(&args) {
                        text = text.replace(&format!("{{{param}}}"), arg);
                    }
                    let mut expanded = body.with_text(text);
                    expanded.included_by = Some(line.number);
                    out.push(expanded);
                }
                out.push(line.with_text(".pop_locblk"));
                out.push(line.with_text(".dbgbrk"));
            }
            None => {
                errors.push(spanned_error!(
                    line.clone(),
                    "no macro `{}` taking {} argument(s)",
                    &cap[1],
                    args.len()
                ));
                out.push(line.with_text("nop"));
            }
        }
    }

    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::source;

    fn run(text: &str) -> (Vec<String>, Errors) {
        let mut errors = Errors::new();
        let lines = preprocess(source::load(text, None), &mut errors)
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.text)
            .collect();
        (lines, errors)
    }

    #[test]
    fn define_substitution() {
        let (lines, errors) = run(".define \"0x4400\", STACK\nmov #[STACK] sp");
        assert!(errors.is_empty());
        assert_eq!(lines, vec!["mov #0x4400 sp"]);
    }

    #[test]
    fn malformed_define_dropped() {
        let (lines, errors) = run(".define oops\nret");
        assert_eq!(errors.len(), 1);
        assert_eq!(lines, vec!["ret"]);
    }

    #[test]
    fn macro_expansion() {
        let (lines, errors) = run(".macro swap(a, b)\nmov {a} {b}\n.endmacro\nswap(r5, r6)");
        assert!(errors.is_empty());
        assert!(lines.contains(&"mov r5 r6".to_owned()));
        assert!(lines.contains(&";!! Macro invocation: swap(r5, r6)".to_owned()));
        assert_eq!(lines.first().map(String::as_str), Some(".push_locblk"));
    }

    #[test]
    fn arity_overload() {
        let (lines, errors) =
            run(".macro f(a)\nmov {a} r6\n.endmacro\n.macro f(a, b)\nmov {a} {b}\n.endmacro\nf(r4)\nf(r4, r5)");
        assert!(errors.is_empty());
        assert!(lines.contains(&"mov r4 r6".to_owned()));
        assert!(lines.contains(&"mov r4 r5".to_owned()));
    }

    #[test]
    fn unknown_invocation_becomes_nop() {
        let (lines, errors) = run("launch(r5)");
        assert_eq!(errors.len(), 1);
        assert_eq!(lines, vec!["nop"]);
    }

    #[test]
    fn recursion_degrades_to_nop() {
        let _guard = recursion_guard();
        let (lines, errors) = run(".macro f(a)\nf({a})\n.endmacro\nf(r5)");
        assert!(errors.iter().any(|e| e.message().contains("recursion limit")));
        assert!(lines.contains(&"nop".to_owned()));
    }

    #[test]
    fn recursion_panic_mode_fails_assembly() {
        let _guard = recursion_guard();
        set_panic_on_recursion(true);
        let mut errors = Errors::new();
        let result = preprocess(
            source::load(".macro f(a)\nf({a})\n.endmacro\nf(r5)", None),
            &mut errors,
        );
        set_panic_on_recursion(false);
        let failure = result.unwrap_err();
        assert!(failure[0].message().contains("recursion limit"));
    }
}
