//! Requirement security screening.
//!
//! Third-party plugins declare package requirements that the host installs on
//! their behalf, so every declared name is screened before any install is
//! attempted. Two independent checks run per package:
//!
//! 1. A configurable regex blocklist. A match is a hard block — the install
//!    is never attempted for that package.
//! 2. A typosquatting heuristic comparing the name against a curated list of
//!    popular package names. A near-miss is a warning surfaced to the caller,
//!    not a block.
//!
//! The raw requirement string is additionally held to a strict character
//! grammar; anything outside it is a hard block. The pattern table, popular
//! list, and distance threshold are policy data, replaceable wholesale.

use regex::Regex;

use crate::manifest::PackageSpec;

/// Popular package names used by the typosquat heuristic.
const DEFAULT_POPULAR_PACKAGES: &[&str] = &[
    "requests", "numpy", "pandas", "scipy", "urllib3", "setuptools", "cryptography",
    "pyyaml", "paramiko", "netmiko", "pysnmp", "jinja2", "click", "rich",
];

/// Blocklist patterns matched against package names.
const DEFAULT_BLOCKLIST_PATTERNS: &[&str] = &[
    r"backdoor",
    r"keylog",
    r"stealer",
    r"ransom",
    r"rootkit",
    r"\d{5,}",
];

/// Grammar for a whole requirement string: a package name followed by an
/// optional operator clause list.
const REQUIREMENT_GRAMMAR: &str =
    r"^[a-zA-Z0-9._-]+\s*((==|>=|<=|~=|!=|<|>)\s*[0-9][0-9a-zA-Z.*+-]*\s*(,\s*(==|>=|<=|~=|!=|<|>)\s*[0-9][0-9a-zA-Z.*+-]*\s*)*)?$";

/// Replaceable screening policy: blocklist patterns, popular-name table, and
/// the edit-distance threshold for typosquat warnings.
pub struct SecurityPolicy {
    blocklist: Vec<Regex>,
    grammar: Regex,
    popular: Vec<String>,
    max_edit_distance: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BLOCKLIST_PATTERNS,
            DEFAULT_POPULAR_PACKAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            1,
        )
    }
}

impl SecurityPolicy {
    /// Build a policy from pattern strings. Invalid patterns are dropped with
    /// a warning rather than taking the whole policy down.
    pub fn new(patterns: &[&str], popular: Vec<String>, max_edit_distance: usize) -> Self {
        let blocklist = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("dropping invalid blocklist pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            blocklist,
            grammar: Regex::new(REQUIREMENT_GRAMMAR).unwrap_or_else(|_| Regex::new("^$").unwrap()),
            popular,
            max_edit_distance,
        }
    }

    /// Screen a set of package specs. Blocked entries must never reach the
    /// installer; warnings are surfaced for confirmation but do not stop the
    /// transition.
    pub fn screen(&self, specs: &[PackageSpec]) -> ScreenReport {
        let mut report = ScreenReport::default();

        for spec in specs {
            if !self.grammar.is_match(&spec.raw) {
                report.blocked.push(ScreenFinding {
                    package: spec.name.clone(),
                    reason: format!("requirement '{}' violates the allowed grammar", spec.raw),
                });
                continue;
            }

            if let Some(pattern) = self.matching_pattern(&spec.name) {
                report.blocked.push(ScreenFinding {
                    package: spec.name.clone(),
                    reason: format!(
                        "package name '{}' matches blocked pattern '{}'",
                        spec.name, pattern
                    ),
                });
                continue;
            }

            if let Some(popular) = self.near_popular_name(&spec.name) {
                report.warnings.push(ScreenFinding {
                    package: spec.name.clone(),
                    reason: format!(
                        "package name '{}' is suspiciously close to popular package '{}'",
                        spec.name, popular
                    ),
                });
            }
        }

        report
    }

    fn matching_pattern(&self, name: &str) -> Option<String> {
        let lower = name.to_lowercase();
        self.blocklist
            .iter()
            .find(|re| re.is_match(&lower))
            .map(|re| re.as_str().to_string())
    }

    /// A popular name within the edit-distance threshold of `name`, excluding
    /// exact matches (requesting the real package is fine).
    fn near_popular_name(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.popular
            .iter()
            .find(|p| {
                p.as_str() != lower && levenshtein(&lower, p) <= self.max_edit_distance
            })
            .map(|p| p.as_str())
    }
}

/// One screening finding: which package and why.
#[derive(Debug, Clone)]
pub struct ScreenFinding {
    pub package: String,
    pub reason: String,
}

/// Result of screening a requirement set.
#[derive(Debug, Clone, Default)]
pub struct ScreenReport {
    /// Hard blocks; the install is never attempted for these.
    pub blocked: Vec<ScreenFinding>,
    /// Non-fatal findings surfaced to the caller.
    pub warnings: Vec<ScreenFinding>,
}

impl ScreenReport {
    pub fn has_blocks(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Names of all blocked packages.
    pub fn blocked_names(&self) -> Vec<&str> {
        self.blocked.iter().map(|f| f.package.as_str()).collect()
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let (m, n) = (a_chars.len(), b_chars.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a_chars[i - 1] == b_chars[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}
