//! Destination glob patterns
//!
//! A POSIX-style glob syntax compiled down to a regular expression, tuned
//! for message destinations rather than file paths:
//!
//! - `*` matches any run of characters, `?` matches a single character
//! - `{name}` is a named capture restricted to `[A-Za-z0-9_-]*`, used for
//!   path-parameter extraction; brace alternation (`{a,b}`) is unsupported
//! - `[...]` character classes pass through, with `[!` translated to `[^`
//! - `\x` escapes `x` literally
//!
//! Compiled patterns are shared through [`GlobCache`], keyed by the literal
//! pattern text.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;

/// Compile errors, reporting the offending pattern and the byte index of
/// the fault.
#[derive(Debug, Error)]
pub enum GlobError {
    #[error("missing escaped character in '{pattern}' at index {index}")]
    MissingEscape { pattern: String, index: usize },

    #[error("invalid comma in '{pattern}' at index {index}")]
    InvalidComma { pattern: String, index: usize },

    #[error("unexpected group close in '{pattern}' at index {index}")]
    UnexpectedGroupClose { pattern: String, index: usize },

    #[error("unclosed group in '{pattern}' at index {index}")]
    UnclosedGroup { pattern: String, index: usize },

    #[error("unexpected character class in '{pattern}' at index {index}")]
    UnexpectedCharClass { pattern: String, index: usize },

    #[error("unclosed character class in '{pattern}' at index {index}")]
    UnclosedCharClass { pattern: String, index: usize },

    #[error("invalid pattern '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
    has_wildcard: bool,
}

impl Glob {
    /// Compile a glob pattern string.
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        let mut regex = String::with_capacity(pattern.len() + 16);
        let mut set_open = 0usize;
        let mut curly_open = 0usize;
        let mut has_wildcard = false;

        let err_pattern = || pattern.to_string();
        let mut chars = pattern.char_indices();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, escaped)) => {
                        regex.push('\\');
                        regex.push(escaped);
                    }
                    None => {
                        return Err(GlobError::MissingEscape {
                            pattern: err_pattern(),
                            index: i,
                        })
                    }
                },
                // regex metacharacters that are not glob metacharacters
                '.' | '$' | '(' | ')' | '|' | '+' => {
                    regex.push('\\');
                    regex.push(c);
                }
                '*' => {
                    regex.push_str(".*");
                    has_wildcard = true;
                }
                '?' => {
                    regex.push('.');
                    has_wildcard = true;
                }
                '{' => {
                    regex.push_str("(?P<");
                    curly_open += 1;
                    has_wildcard = true;
                }
                ',' => {
                    if curly_open > 0 {
                        return Err(GlobError::InvalidComma {
                            pattern: err_pattern(),
                            index: i,
                        });
                    }
                    regex.push(c);
                }
                '}' => {
                    if curly_open == 0 {
                        return Err(GlobError::UnexpectedGroupClose {
                            pattern: err_pattern(),
                            index: i,
                        });
                    }
                    curly_open -= 1;
                    regex.push_str(">[A-Za-z0-9_-]*)");
                }
                '[' => {
                    if set_open > 0 {
                        return Err(GlobError::UnexpectedCharClass {
                            pattern: err_pattern(),
                            index: i,
                        });
                    }
                    set_open += 1;
                    has_wildcard = true;
                    regex.push(c);
                }
                // `^` only has meaning inside a class
                '^' => {
                    if set_open == 0 {
                        regex.push('\\');
                    }
                    regex.push(c);
                }
                // `[!` is the glob spelling of `[^`
                '!' => {
                    let previous = pattern[..i].chars().last();
                    if set_open > 0 && previous == Some('[') {
                        regex.push('^');
                    } else {
                        regex.push('!');
                    }
                }
                ']' => {
                    // Degenerate sets such as `[]]` or `[-]` are left for
                    // the regex compiler to police.
                    set_open = 0;
                    regex.push(c);
                }
                other => regex.push(other),
            }
        }

        if set_open > 0 {
            return Err(GlobError::UnclosedCharClass {
                pattern: err_pattern(),
                index: pattern.len(),
            });
        }
        if curly_open > 0 {
            return Err(GlobError::UnclosedGroup {
                pattern: err_pattern(),
                index: pattern.len(),
            });
        }

        let regex = Regex::new(&format!("^{regex}$")).map_err(|source| GlobError::Regex {
            pattern: err_pattern(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            has_wildcard,
        })
    }

    /// The literal pattern text this glob was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern contains any wildcard construct.
    pub fn has_wildcard(&self) -> bool {
        self.has_wildcard
    }

    /// Full-match the input against the pattern.
    pub fn matches(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    /// Full-match and extract named `{...}` captures.
    pub fn captures(&self, input: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(input)?;
        let mut out = HashMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                out.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Some(out)
    }
}

/// A bounded cache of compiled globs keyed by pattern text.
///
/// Identical pattern strings share one compiled matcher; entries are evicted
/// arbitrarily once the cache is full and simply recompiled on next use.
#[derive(Debug)]
pub struct GlobCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Arc<Glob>>>,
}

impl GlobCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the compiled glob for `pattern`, compiling on first use.
    pub fn get(&self, pattern: &str) -> Result<Arc<Glob>, GlobError> {
        let mut entries = self.entries.lock();
        if let Some(glob) = entries.get(pattern) {
            return Ok(glob.clone());
        }

        let glob = Arc::new(Glob::compile(pattern)?);
        if entries.len() >= self.capacity {
            if let Some(evict) = entries.keys().next().cloned() {
                entries.remove(&evict);
            }
        }
        entries.insert(pattern.to_string(), glob.clone());
        Ok(glob)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for GlobCache {
    fn default() -> Self {
        Self::new(256)
    }
}
