//! Plugin manifest parsing and validation.
//!
//! Every plugin directory carries a `plugin.json` describing the plugin's
//! identity, version, entry point, and declared dependencies. The manifest is
//! parsed once at discovery time into an immutable [`PluginManifest`] and
//! replaced wholesale if the plugin's files change and re-discovery runs.
//!
//! Validation fails closed: any unparseable field is an error, never a
//! warning, and an invalid manifest keeps the plugin unselectable.

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::APP_VERSION;

/// Declared dependency on another plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    pub id: String,
    /// Version range, same grammar as package requirement constraints.
    pub version: String,
}

/// Third-party requirements a plugin declares for its private environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Python package requirement strings, e.g. `"requests>=2.25,<3.0"`.
    #[serde(default)]
    pub python: Vec<String>,

    /// Free-form system-level requirements, informational only.
    #[serde(default)]
    pub system: Vec<String>,
}

/// One released version in a plugin's changelog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub version: String,
    pub date: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Immutable plugin metadata parsed from `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin id, `[a-z0-9_-]+`.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Plugin version (semver).
    pub version: String,

    /// Well-known entry symbol resolved against the host's factory registry.
    pub entry_point: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Minimum host application version this plugin supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,

    /// Maximum host application version this plugin supports (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PluginDependency>,

    #[serde(default)]
    pub requirements: Requirements,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changelog: Vec<ChangelogEntry>,
}

impl PluginManifest {
    /// Load and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        Ok(manifest)
    }

    /// SHA-256 of the manifest file content, used to detect manifest changes
    /// between installs.
    pub fn content_hash(path: &Path) -> Result<String> {
        let content = fs::read(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Parse this manifest's declared python requirements into specs.
    /// Errors on the first malformed requirement string.
    pub fn package_specs(&self) -> Result<Vec<PackageSpec>> {
        self.requirements
            .python
            .iter()
            .map(|raw| PackageSpec::parse(raw))
            .collect()
    }
}

/// A version constraint decomposed from a requirement string.
///
/// Supports the exact, minimum, and bounded-range forms used by plugin
/// requirement declarations. Intersection emptiness between two constraints
/// is what the conflict detector reports on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionConstraint {
    /// Any version.
    Any,
    /// Exactly this version (`==1.2.3`).
    Exact(Version),
    /// This version or newer (`>=1.2`).
    Minimum(Version),
    /// At least `min`, strictly below `max` (`>=1.2,<2.0`).
    Range { min: Version, max: Version },
}

impl VersionConstraint {
    /// Parse the constraint part of a requirement string (everything after
    /// the package name). An empty string means any version.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(VersionConstraint::Any);
        }

        if let Some(rest) = s.strip_prefix("==") {
            return Ok(VersionConstraint::Exact(parse_loose_version(rest.trim())?));
        }

        if let Some(rest) = s.strip_prefix(">=") {
            // Either a bare minimum or a bounded range ">=a,<b"
            if let Some((min_part, max_part)) = rest.split_once(',') {
                let max_part = max_part.trim();
                let max_part = max_part
                    .strip_prefix('<')
                    .ok_or_else(|| anyhow!("range upper bound must use '<': {}", s))?;
                let min = parse_loose_version(min_part.trim())?;
                let max = parse_loose_version(max_part.trim())?;
                if max <= min {
                    return Err(anyhow!("empty version range: {}", s));
                }
                return Ok(VersionConstraint::Range { min, max });
            }
            return Ok(VersionConstraint::Minimum(parse_loose_version(rest.trim())?));
        }

        Err(anyhow!("unsupported version constraint: {}", s))
    }

    /// Does a concrete version satisfy this constraint?
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(v) => version == v,
            VersionConstraint::Minimum(v) => version >= v,
            VersionConstraint::Range { min, max } => version >= min && version < max,
        }
    }

    /// Interval bounds: (inclusive lower, (upper, upper-inclusive)).
    fn bounds(&self) -> (Option<&Version>, Option<(&Version, bool)>) {
        match self {
            VersionConstraint::Any => (None, None),
            VersionConstraint::Exact(v) => (Some(v), Some((v, true))),
            VersionConstraint::Minimum(v) => (Some(v), None),
            VersionConstraint::Range { min, max } => (Some(min), Some((max, false))),
        }
    }

    /// Whether any version can satisfy both constraints at once.
    pub fn intersects(&self, other: &VersionConstraint) -> bool {
        let (lo_a, hi_a) = self.bounds();
        let (lo_b, hi_b) = other.bounds();

        // Highest of the two inclusive lower bounds.
        let lo = match (lo_a, lo_b) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let Some(lo) = lo else {
            return true;
        };

        for hi in [hi_a, hi_b].into_iter().flatten() {
            let (upper, inclusive) = hi;
            let empty = if inclusive { lo > upper } else { lo >= upper };
            if empty {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) => write!(f, "=={}", v),
            VersionConstraint::Minimum(v) => write!(f, ">={}", v),
            VersionConstraint::Range { min, max } => write!(f, ">={},<{}", min, max),
        }
    }
}

/// Parse a version that may omit trailing components ("2.25" -> "2.25.0").
fn parse_loose_version(s: &str) -> Result<Version> {
    if let Ok(v) = Version::parse(s) {
        return Ok(v);
    }
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(anyhow!("invalid version: {}", s));
    }
    let mut nums = [0u64; 3];
    for (i, part) in parts.iter().enumerate() {
        nums[i] = part
            .parse::<u64>()
            .map_err(|_| anyhow!("invalid version component '{}' in {}", part, s))?;
    }
    Ok(Version::new(nums[0], nums[1], nums[2]))
}

/// A single package requirement: name plus version constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub constraint: VersionConstraint,
    /// The requirement string as declared in the manifest.
    pub raw: String,
}

impl PackageSpec {
    /// Parse a requirement string like `"requests>=2.25,<3.0"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty requirement string"));
        }

        let split_at = raw
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
            .unwrap_or(raw.len());
        let (name, constraint_str) = raw.split_at(split_at);

        if name.is_empty() {
            return Err(anyhow!("requirement has no package name: {}", raw));
        }

        let constraint = VersionConstraint::parse(constraint_str)
            .with_context(|| format!("in requirement '{}'", raw))?;

        Ok(Self {
            name: name.to_string(),
            constraint,
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, match &self.constraint {
            VersionConstraint::Any => String::new(),
            c => c.to_string(),
        })
    }
}

/// Outcome of manifest validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn failed(errors: Vec<String>) -> Self {
        Self { ok: false, errors }
    }

    fn passed() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }
}

/// Schema validation of a parsed manifest. Performs no I/O.
pub struct ManifestValidator;

impl ManifestValidator {
    /// Check required fields, id pattern, version grammar, dependency ranges,
    /// requirement syntax, and host app version compatibility.
    pub fn validate(manifest: &PluginManifest) -> ValidationResult {
        let mut errors = Vec::new();

        if manifest.id.is_empty() {
            errors.push("manifest field 'id' is empty".to_string());
        } else if !manifest
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            errors.push(format!(
                "plugin id '{}' must match [a-z0-9_-]+",
                manifest.id
            ));
        }

        if manifest.name.is_empty() {
            errors.push("manifest field 'name' is empty".to_string());
        }
        if manifest.entry_point.is_empty() {
            errors.push("manifest field 'entry_point' is empty".to_string());
        }

        if let Err(e) = Version::parse(&manifest.version) {
            errors.push(format!("invalid plugin version '{}': {}", manifest.version, e));
        }

        app_version_check(manifest, &mut errors);

        for dep in &manifest.dependencies {
            if let Err(e) = VersionConstraint::parse(&dep.version) {
                errors.push(format!(
                    "invalid version range '{}' for dependency '{}': {}",
                    dep.version, dep.id, e
                ));
            }
        }

        for raw in &manifest.requirements.python {
            if let Err(e) = PackageSpec::parse(raw) {
                errors.push(format!("invalid requirement '{}': {:#}", raw, e));
            }
        }

        if errors.is_empty() {
            ValidationResult::passed()
        } else {
            ValidationResult::failed(errors)
        }
    }
}

fn app_version_check(manifest: &PluginManifest, errors: &mut Vec<String>) {
    let current = match Version::parse(APP_VERSION) {
        Ok(v) => v,
        Err(_) => return,
    };

    if let Some(min) = &manifest.min_app_version {
        match Version::parse(min) {
            Ok(min) if current < min => {
                errors.push(format!(
                    "plugin requires app version >= {}, current is {}",
                    min, current
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("invalid min_app_version '{}': {}", min, e)),
        }
    }

    if let Some(max) = &manifest.max_app_version {
        match Version::parse(max) {
            Ok(max) if current > max => {
                errors.push(format!(
                    "plugin supports app versions up to {}, current is {}",
                    max, current
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("invalid max_app_version '{}': {}", max, e)),
        }
    }
}
