//! Prohibited code constructs
//!
//! One denylist is shared by the pre-install validator and the secure
//! execution engine, so a package can never pass validation with a construct
//! the sandbox would refuse (or the reverse).
//!
//! # Example
//!
//! ```
//! use enclave_engine::security::patterns::CodePatterns;
//!
//! let patterns = CodePatterns::new().unwrap();
//! let hit = patterns.first_hit("x = 1\neval(\"2\")").unwrap();
//! assert_eq!(hit.code, "dynamic_code_evaluation");
//! assert_eq!(hit.line, 2);
//! ```

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::Severity;

/// Code used for dynamic evaluation hits; always critical
pub const DYNAMIC_EVALUATION: &str = "dynamic_code_evaluation";

/// A compiled denylist entry
struct DeniedPattern {
    code: &'static str,
    label: &'static str,
    severity: Severity,
    regex: Regex,
}

/// A denylist match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub code: &'static str,
    pub label: &'static str,
    pub severity: Severity,
    /// Matched text
    pub matched: String,
    /// 1-based line number of the match
    pub line: usize,
}

/// Denylist of constructs plugin code may not contain
pub struct CodePatterns {
    patterns: Vec<DeniedPattern>,
    identifier: Regex,
    string_literal: Regex,
    hex_escape: Regex,
    id_slug: Regex,
}

const DENYLIST: &[(&str, &str, Severity, &str)] = &[
    (DYNAMIC_EVALUATION, "eval()", Severity::Critical, r"eval\s*\("),
    ("reflective_constructor", "Function constructor", Severity::High, r"\bnew\s+Function\b|\bFunction\s*\("),
    ("prototype_access", "__proto__", Severity::High, r"__proto__"),
    ("prototype_access", "prototype", Severity::High, r"\bprototype\b"),
    ("prototype_access", "constructor", Severity::High, r"\bconstructor\b"),
    ("global_object_access", "globalThis", Severity::High, r"\bglobalThis\b"),
    ("global_object_access", "window", Severity::High, r"\bwindow\b"),
    ("global_object_access", "document", Severity::High, r"\bdocument\b"),
    ("global_object_access", "process", Severity::High, r"\bprocess\b"),
    ("dynamic_import", "import()", Severity::High, r"\bimport\s*\("),
    ("dynamic_import", "require()", Severity::High, r"\brequire\s*\("),
    ("ambient_network", "fetch()", Severity::High, r"\bfetch\s*\("),
    ("ambient_network", "XMLHttpRequest", Severity::High, r"\bXMLHttpRequest\b"),
    ("ambient_network", "WebSocket", Severity::High, r"\bWebSocket\b"),
    ("ambient_storage", "localStorage", Severity::High, r"\blocalStorage\b"),
    ("ambient_storage", "sessionStorage", Severity::High, r"\bsessionStorage\b"),
    ("ambient_storage", "indexedDB", Severity::High, r"\bindexedDB\b"),
    ("string_timer", "string-form timer", Severity::High, r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#),
    ("with_statement", "with statement", Severity::High, r"\bwith\s*\("),
];

impl CodePatterns {
    /// Compile the denylist
    pub fn new() -> Result<Self, EngineError> {
        let compile = |src: &str| {
            Regex::new(src).map_err(|e| EngineError::Config(format!("Bad code pattern: {}", e)))
        };

        let patterns = DENYLIST
            .iter()
            .map(|(code, label, severity, src)| {
                Ok(DeniedPattern {
                    code: *code,
                    label: *label,
                    severity: *severity,
                    regex: compile(*src)?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Self {
            patterns,
            identifier: compile(r"[A-Za-z_$][A-Za-z0-9_$]*")?,
            string_literal: compile(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#)?,
            hex_escape: compile(r"\\x[0-9A-Fa-f]{2}")?,
            id_slug: compile(r"^[a-z0-9](?:[a-z0-9._-]{0,62}[a-z0-9])?$")?,
        })
    }

    /// Every denylist entry that matches, first occurrence each
    pub fn scan(&self, code: &str) -> Vec<PatternHit> {
        self.patterns
            .iter()
            .filter_map(|p| {
                p.regex.find(code).map(|m| PatternHit {
                    code: p.code,
                    label: p.label,
                    severity: p.severity,
                    matched: m.as_str().to_string(),
                    line: line_of(code, m.start()),
                })
            })
            .collect()
    }

    /// Earliest denylist match in the code, if any
    pub fn first_hit(&self, code: &str) -> Option<PatternHit> {
        self.scan(code).into_iter().min_by_key(|hit| hit.line)
    }

    /// Average identifier length and identifier count
    pub fn identifier_stats(&self, code: &str) -> (f64, usize) {
        let lengths: Vec<usize> = self.identifier.find_iter(code).map(|m| m.len()).collect();
        if lengths.is_empty() {
            return (0.0, 0);
        }
        let total: usize = lengths.iter().sum();
        (total as f64 / lengths.len() as f64, lengths.len())
    }

    /// Length in characters of the longest quoted string literal
    pub fn longest_string_literal(&self, code: &str) -> usize {
        self.string_literal
            .find_iter(code)
            .map(|m| m.as_str().chars().count().saturating_sub(2))
            .max()
            .unwrap_or(0)
    }

    /// Whether a plugin id is a lowercase slug of at most 64 characters
    pub fn is_valid_id(&self, id: &str) -> bool {
        self.id_slug.is_match(id)
    }

    /// Number of `\xNN` escapes
    pub fn hex_escape_count(&self, code: &str) -> usize {
        self.hex_escape.find_iter(code).count()
    }
}

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_is_critical_anywhere() {
        let patterns = CodePatterns::new().unwrap();
        for code in ["eval('1')", "x = 1; eval (y)", "api.storage.set(\"k\", medieval(1))"] {
            let hits = patterns.scan(code);
            assert!(
                hits.iter()
                    .any(|h| h.code == DYNAMIC_EVALUATION && h.severity == Severity::Critical),
                "no eval hit for {}",
                code
            );
        }
    }

    #[test]
    fn test_clean_code_has_no_hits() {
        let patterns = CodePatterns::new().unwrap();
        let code = "const city = config.city\nawait api.http.get(\"https://api.example.com\")\nconsole.log(\"done\")";
        assert!(patterns.scan(code).is_empty());
    }

    #[test]
    fn test_each_family_is_detected() {
        let patterns = CodePatterns::new().unwrap();
        let cases = [
            ("new Function('return 1')", "reflective_constructor"),
            ("a.__proto__", "prototype_access"),
            ("globalThis.x", "global_object_access"),
            ("import('x')", "dynamic_import"),
            ("require('fs')", "dynamic_import"),
            ("fetch('https://x')", "ambient_network"),
            ("new WebSocket(u)", "ambient_network"),
            ("localStorage.getItem(k)", "ambient_storage"),
            ("setTimeout(\"alert(1)\", 10)", "string_timer"),
            ("with (obj) {}", "with_statement"),
        ];
        for (code, expected) in cases {
            let hit = patterns.first_hit(code).unwrap();
            assert_eq!(hit.code, expected, "for {}", code);
        }
    }

    #[test]
    fn test_words_inside_identifiers_do_not_match() {
        let patterns = CodePatterns::new().unwrap();
        assert!(patterns.scan("processing = 1\nwindowed = 2").is_empty());
    }

    #[test]
    fn test_obfuscation_metrics() {
        let patterns = CodePatterns::new().unwrap();
        let (avg, count) = patterns.identifier_stats("a = b\nc = d");
        assert_eq!(count, 4);
        assert!((avg - 1.0).abs() < f64::EPSILON);

        let literal = format!("x = \"{}\"", "y".repeat(1200));
        assert_eq!(patterns.longest_string_literal(&literal), 1200);
        assert_eq!(patterns.hex_escape_count(r#"s = "\x41\x42""#), 2);
    }
}
