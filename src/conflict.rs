//! Requirement version-conflict detection across plugins.
//!
//! Each plugin's dependencies are installed into its own private directory,
//! so overlapping-but-incompatible version ranges between plugins are never
//! fatal. They are still worth surfacing: two plugins disagreeing about a
//! package usually signals a stale manifest. Detection therefore emits
//! warnings only and never changes control flow.

use std::collections::HashMap;
use std::fmt;

use crate::manifest::PackageSpec;

/// A non-fatal range conflict between a candidate plugin and an installed one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictWarning {
    pub package: String,
    pub candidate_plugin: String,
    pub candidate_range: String,
    pub installed_plugin: String,
    pub installed_range: String,
}

impl fmt::Display for ConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "package '{}': '{}' wants {} but '{}' wants {} (no overlapping version)",
            self.package,
            self.candidate_plugin,
            self.candidate_range,
            self.installed_plugin,
            self.installed_range
        )
    }
}

/// Compare a candidate plugin's requirements against every already-enabled
/// plugin's requirements and flag package names whose declared ranges have an
/// empty intersection.
pub fn detect_conflicts(
    candidate_plugin: &str,
    candidate: &[PackageSpec],
    installed: &HashMap<String, Vec<PackageSpec>>,
) -> Vec<ConflictWarning> {
    let mut warnings = Vec::new();

    for spec in candidate {
        for (other_plugin, other_specs) in installed {
            if other_plugin == candidate_plugin {
                continue;
            }
            for other in other_specs.iter().filter(|o| o.name == spec.name) {
                if !spec.constraint.intersects(&other.constraint) {
                    warnings.push(ConflictWarning {
                        package: spec.name.clone(),
                        candidate_plugin: candidate_plugin.to_string(),
                        candidate_range: spec.constraint.to_string(),
                        installed_plugin: other_plugin.clone(),
                        installed_range: other.constraint.to_string(),
                    });
                }
            }
        }
    }

    warnings.sort_by(|a, b| {
        (&a.package, &a.installed_plugin).cmp(&(&b.package, &b.installed_plugin))
    });
    warnings
}
