//! Textual hardware-level code module.
//!
//! The exporter produces one of these per compilation; math libraries on
//! disk are the same format. The module is line-oriented so the linker
//! can pull definitions across modules without a full instruction model:
//! symbols are `@name` tokens, and whatever a body line mentions it
//! references.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Calling convention of a defined function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    /// Ordinary device-side function.
    Device,
    /// Hardware-launched kernel entry point.
    Kernel,
}

/// One function definition: rendered parameter list, string attributes,
/// and a body of instruction lines.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeFunction {
    pub name: String,
    pub params: Vec<String>,
    pub call_conv: CallConv,
    pub attrs: BTreeMap<String, String>,
    pub body: Vec<String>,
}

impl CodeFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            call_conv: CallConv::Device,
            attrs: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Symbols this function's body mentions.
    pub fn referenced_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for line in &self.body {
            collect_symbols(line, &mut out);
        }
        out
    }
}

/// Module-level per-function annotation, e.g. launch bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub func: String,
    pub key: String,
    pub value: u32,
}

/// A whole code module: externs, flags, functions, annotations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeModule {
    pub name: String,
    pub externs: BTreeSet<String>,
    pub flags: BTreeMap<String, u32>,
    pub functions: Vec<CodeFunction>,
    pub annotations: Vec<Annotation>,
}

impl CodeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&CodeFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut CodeFunction> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn defined_symbols(&self) -> BTreeSet<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    /// Symbols referenced anywhere in the module bodies.
    pub fn referenced_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for func in &self.functions {
            for line in &func.body {
                collect_symbols(line, &mut out);
            }
        }
        out
    }

    /// Referenced but neither defined nor declared extern here.
    pub fn unresolved_symbols(&self) -> BTreeSet<String> {
        let defined = self.defined_symbols();
        self.referenced_symbols()
            .into_iter()
            .filter(|s| !defined.contains(s))
            .collect()
    }

    /// Content fingerprint of the emitted text.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.to_string().as_bytes()).to_hex().to_string()
    }

    /// Parse the textual form back into a module.
    pub fn parse(text: &str) -> Result<CodeModule, ParseError> {
        let mut module = CodeModule::default();
        let mut current: Option<CodeFunction> = None;

        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let err = |message: &str| ParseError {
                line: i + 1,
                message: message.to_string(),
            };
            if line.is_empty() || line.starts_with(';') {
                if let Some(rest) = line.strip_prefix("; module ") {
                    if module.name.is_empty() {
                        module.name = rest.trim().to_string();
                    }
                }
                continue;
            }
            if current.is_some() {
                if line == "}" {
                    if let Some(func) = current.take() {
                        module.functions.push(func);
                    }
                } else if let Some(rest) = line.strip_prefix("!attr ") {
                    let (key, value) =
                        parse_quoted_pair(rest).ok_or_else(|| err("malformed attribute"))?;
                    if let Some(func) = current.as_mut() {
                        func.attrs.insert(key, value);
                    }
                } else if let Some(func) = current.as_mut() {
                    func.body.push(line.to_string());
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("extern @") {
                module.externs.insert(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("flag ") {
                let (key, value) =
                    parse_quoted_pair(rest).ok_or_else(|| err("malformed module flag"))?;
                let value: u32 = value.parse().map_err(|_| err("flag value is not an integer"))?;
                module.flags.insert(key, value);
            } else if let Some(rest) = line.strip_prefix("annotate @") {
                let mut parts = rest.split_whitespace();
                let (Some(func), Some(key), Some(value)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(err("malformed annotation"));
                };
                module.annotations.push(Annotation {
                    func: func.to_string(),
                    key: key.trim_matches('"').to_string(),
                    value: value.parse().map_err(|_| err("annotation value is not an integer"))?,
                });
            } else if let Some(rest) = line.strip_prefix("define ") {
                current = Some(parse_define(rest).ok_or_else(|| err("malformed definition"))?);
            } else {
                return Err(err("unrecognized directive"));
            }
        }
        if current.is_some() {
            return Err(ParseError {
                line: text.lines().count(),
                message: "unterminated function body".to_string(),
            });
        }
        Ok(module)
    }
}

fn parse_define(rest: &str) -> Option<CodeFunction> {
    let (call_conv, rest) = match rest.strip_prefix("kernel ") {
        Some(rest) => (CallConv::Kernel, rest),
        None => (CallConv::Device, rest),
    };
    let rest = rest.strip_prefix('@')?;
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let name = rest[..open].to_string();
    let params: Vec<String> = rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if !rest[close + 1..].trim_start().starts_with('{') {
        return None;
    }
    Some(CodeFunction {
        name,
        params,
        call_conv,
        attrs: BTreeMap::new(),
        body: Vec::new(),
    })
}

/// `"key" = "value"` pairs used by flags and attributes.
fn parse_quoted_pair(s: &str) -> Option<(String, String)> {
    let (key, rest) = s.trim().split_once('=')?;
    let key = key.trim().trim_matches('"');
    let value = rest.trim().trim_matches('"');
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$')
}

fn collect_symbols(line: &str, out: &mut BTreeSet<String>) {
    let mut rest = line;
    while let Some(at) = rest.find('@') {
        let tail = &rest[at + 1..];
        let end = tail.find(|c| !is_symbol_char(c)).unwrap_or(tail.len());
        if end > 0 {
            out.insert(tail[..end].to_string());
        }
        rest = &tail[end..];
    }
}

impl fmt::Display for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for (key, value) in &self.flags {
            writeln!(f, "flag \"{}\" = {}", key, value)?;
        }
        for ext in &self.externs {
            writeln!(f, "extern @{}", ext)?;
        }
        for func in &self.functions {
            let cc = match func.call_conv {
                CallConv::Device => "",
                CallConv::Kernel => "kernel ",
            };
            writeln!(f, "define {}@{}({}) {{", cc, func.name, func.params.join(", "))?;
            for (key, value) in &func.attrs {
                writeln!(f, "  !attr \"{}\" = \"{}\"", key, value)?;
            }
            for line in &func.body {
                writeln!(f, "  {}", line)?;
            }
            writeln!(f, "}}")?;
        }
        for a in &self.annotations {
            writeln!(f, "annotate @{} {} {}", a.func, a.key, a.value)?;
        }
        Ok(())
    }
}

/// Textual-module parse failure, with a 1-based line number.
#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CodeModule {
        let mut m = CodeModule::new("m");
        m.flags.insert("reflect-ftz".into(), 1);
        m.externs.insert("__tl_exp_f32".into());
        let mut f = CodeFunction::new("k");
        f.call_conv = CallConv::Kernel;
        f.params = vec!["f32* %arg0".into()];
        f.attrs.insert("amdgpu-flat-work-group-size".into(), "1, 1024".into());
        f.body = vec!["%0 = ld.global %arg0".into(), "%1 = call @__tl_exp_f32 %0".into(), "ret".into()];
        m.functions.push(f);
        m.annotations.push(Annotation {
            func: "k".into(),
            key: "maxntidx".into(),
            value: 128,
        });
        m
    }

    #[test]
    fn test_round_trip() {
        let m = sample();
        let text = m.to_string();
        let parsed = CodeModule::parse(&text).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn test_symbol_scan() {
        let m = sample();
        assert_eq!(
            m.defined_symbols().into_iter().collect::<Vec<_>>(),
            vec!["k".to_string()]
        );
        assert!(m.referenced_symbols().contains("__tl_exp_f32"));
        // Declared extern, so unresolved still reports it; resolution
        // against libraries is the linker's job.
        assert!(m.unresolved_symbols().contains("__tl_exp_f32"));
        assert!(!m.unresolved_symbols().contains("k"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let m = sample();
        let a = m.fingerprint();
        assert_eq!(a, sample().fingerprint());
        let mut changed = sample();
        changed.functions[0].body.push("nop".into());
        assert_ne!(a, changed.fingerprint());
    }

    #[test]
    fn test_parse_reports_line() {
        let err = CodeModule::parse("garbage here\n").unwrap_err();
        assert_eq!(err.line, 1);
        let err = CodeModule::parse("define @f() {\n ret\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let text = "; module lib\n\n; a comment\nextern @x\n";
        let m = CodeModule::parse(text).unwrap();
        assert_eq!(m.name, "lib");
        assert!(m.externs.contains("x"));
    }
}
