//! Source preprocessing: `#pragma` collection and `#define` substitution.
//!
//! Directive lines are blanked (not removed) so byte offsets keep their
//! line numbers. Define substitution respects identifier boundaries and
//! skips string literals and comments. `#include` stays unsupported here;
//! include paths are carried for the embedding host.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::diagnostics::Diagnostic;

/// A collected `#pragma name value` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pragma {
    pub name: String,
    pub value: String,
    pub line: u32,
}

/// Preprocessing output: cleaned source plus collected pragmas.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub source: String,
    pub pragmas: Vec<Pragma>,
}

/// The preprocessor: host-registered defines and include paths.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    defines: IndexMap<String, String>,
    include_paths: Vec<PathBuf>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a define visible to every subsequent run.
    pub fn add_define(&mut self, name: &str, value: &str) {
        self.defines.insert(name.to_owned(), value.to_owned());
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.include_paths = paths;
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    /// Process directives and apply defines.
    pub fn preprocess(&self, source: &str) -> Result<Preprocessed, Diagnostic> {
        let mut defines = self.defines.clone();
        let mut pragmas = Vec::new();
        let mut cleaned = String::with_capacity(source.len());
        let mut offset = 0usize;

        for (line_number, line) in source.split_inclusive('\n').enumerate() {
            let trimmed = line.trim_start();
            if let Some(directive) = trimmed.strip_prefix('#') {
                let directive = directive.trim_end();
                let (word, rest) = split_word(directive);
                match word {
                    "pragma" => {
                        let (name, value) = split_word(rest);
                        if name.is_empty() {
                            return Err(Diagnostic::error(
                                "M0001",
                                offset..offset + line.len(),
                                "pragma directive without a name",
                            ));
                        }
                        pragmas.push(Pragma {
                            name: name.to_owned(),
                            value: value.trim().to_owned(),
                            line: line_number as u32 + 1,
                        });
                    }
                    "define" => {
                        let (name, value) = split_word(rest);
                        if name.is_empty() {
                            return Err(Diagnostic::error(
                                "M0002",
                                offset..offset + line.len(),
                                "define directive without a name",
                            ));
                        }
                        defines.insert(name.to_owned(), value.trim().to_owned());
                    }
                    "include" => {
                        return Err(Diagnostic::error(
                            "M0003",
                            offset..offset + line.len(),
                            "include directives are not supported",
                        )
                        .with_hint("resolve includes in the embedding host"));
                    }
                    other => {
                        return Err(Diagnostic::error(
                            "M0004",
                            offset..offset + line.len(),
                            format!("unknown directive `#{other}`"),
                        ));
                    }
                }
                // keep the newline so line numbers survive
                if line.ends_with('\n') {
                    cleaned.push('\n');
                }
            } else {
                cleaned.push_str(line);
            }
            offset += line.len();
        }

        Ok(Preprocessed {
            source: substitute(&cleaned, &defines),
            pragmas,
        })
    }
}

/// Split off the first whitespace-delimited word.
fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(index) => (&text[..index], &text[index..]),
        None => (text, ""),
    }
}

/// Replace defined identifiers at identifier boundaries, skipping string
/// literals and comments.
fn substitute(source: &str, defines: &IndexMap<String, String>) -> String {
    if defines.is_empty() {
        return source.to_owned();
    }

    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let end = scan_string(bytes, i);
                out.push_str(&source[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = source[i..].find('\n').map(|n| i + n).unwrap_or(bytes.len());
                out.push_str(&source[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = source[i + 2..]
                    .find("*/")
                    .map(|n| i + 2 + n + 2)
                    .unwrap_or(bytes.len());
                out.push_str(&source[i..end]);
                i = end;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                let word = &source[i..end];
                match defines.get(word) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(word),
                }
                i = end;
            }
            _ => {
                let ch = source[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    out
}

fn scan_string(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn pragmas_are_collected_and_blanked() {
        let preprocessor = Preprocessor::new();
        let result = preprocessor
            .preprocess(indoc! {"
                #pragma endian little
                u32 x @ 0x00;
            "})
            .unwrap();

        assert_eq!(result.pragmas.len(), 1);
        assert_eq!(result.pragmas[0].name, "endian");
        assert_eq!(result.pragmas[0].value, "little");
        assert_eq!(result.pragmas[0].line, 1);
        assert!(result.source.starts_with('\n'));
        assert!(result.source.contains("u32 x @ 0x00;"));
    }

    #[test]
    fn defines_substitute_at_identifier_boundaries() {
        let preprocessor = Preprocessor::new();
        let result = preprocessor
            .preprocess("#define SIZE 4\nu8 data[SIZE];\nu8 SIZED;\n")
            .unwrap();

        assert!(result.source.contains("u8 data[4];"));
        assert!(result.source.contains("u8 SIZED;"));
    }

    #[test]
    fn host_defines_apply() {
        let mut preprocessor = Preprocessor::new();
        preprocessor.add_define("BASE", "0x100");
        let result = preprocessor.preprocess("u32 x @ BASE;").unwrap();

        assert_eq!(result.source, "u32 x @ 0x100;");
    }

    #[test]
    fn defines_skip_comments_and_strings() {
        let mut preprocessor = Preprocessor::new();
        preprocessor.add_define("X", "1");
        let result = preprocessor.preprocess("// X stays\nu8 a[X];").unwrap();

        assert!(result.source.contains("// X stays"));
        assert!(result.source.contains("u8 a[1];"));
    }

    #[test]
    fn include_is_rejected() {
        let preprocessor = Preprocessor::new();
        let error = preprocessor.preprocess("#include <std/mem.pat>").unwrap_err();

        assert_eq!(error.code, "M0003");
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let preprocessor = Preprocessor::new();
        let error = preprocessor.preprocess("#frobnicate").unwrap_err();

        assert_eq!(error.code, "M0004");
    }
}
