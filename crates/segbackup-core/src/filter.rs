//! Schema and relation selection.
//!
//! Patterns are globs supporting `*` and `?`, or regular expressions when
//! prefixed with `~`. Relation patterns are matched against `schema.name`.

use crate::config::ObjectSelection;
use crate::Result;

/// Schemas that are never captured or restored.
pub const SYSTEM_SCHEMAS: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_toast",
    "pg_aoseg",
    "pg_bitmapindex",
    "gp_toolkit",
];

impl ObjectSelection {
    /// Selection that keeps everything outside the system schemas.
    pub fn all() -> Self {
        Self::default()
    }

    /// Check that every `~` pattern compiles.
    pub fn validate(&self) -> Result<()> {
        for pattern in self
            .include_schemas
            .iter()
            .chain(&self.exclude_schemas)
            .chain(&self.include_relations)
            .chain(&self.exclude_relations)
        {
            if let Some(re) = pattern.strip_prefix('~') {
                regex::Regex::new(re).map_err(|e| {
                    crate::Error::Config(format!("Invalid pattern '{}': {}", pattern, e))
                })?;
            }
        }
        Ok(())
    }

    /// Whether relation-level include patterns narrow the selection.
    pub fn has_relation_includes(&self) -> bool {
        !self.include_relations.is_empty()
    }

    /// Whether objects in `schema` may be selected at all.
    pub fn matches_schema(&self, schema: &str) -> bool {
        if SYSTEM_SCHEMAS.contains(&schema) || schema.starts_with("pg_temp") {
            return false;
        }
        if !self.include_schemas.is_empty()
            && !self.include_schemas.iter().any(|p| pattern_match(p, schema))
        {
            return false;
        }
        !self.exclude_schemas.iter().any(|p| pattern_match(p, schema))
    }

    /// Whether the relation `schema.name` is selected.
    pub fn matches_relation(&self, schema: &str, name: &str) -> bool {
        if !self.matches_schema(schema) {
            return false;
        }
        let qualified = format!("{}.{}", schema, name);
        if self.has_relation_includes()
            && !self
                .include_relations
                .iter()
                .any(|p| pattern_match(p, &qualified))
        {
            return false;
        }
        !self
            .exclude_relations
            .iter()
            .any(|p| pattern_match(p, &qualified))
    }
}

/// Match `text` against a glob or `~regex` pattern.
pub fn pattern_match(pattern: &str, text: &str) -> bool {
    if let Some(regex_pattern) = pattern.strip_prefix('~') {
        match regex::Regex::new(regex_pattern) {
            Ok(re) => re.is_match(text),
            Err(_) => false,
        }
    } else {
        glob_match(pattern, text)
    }
}

/// Glob matching with `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative matcher with single-star backtracking
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
