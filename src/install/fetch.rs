//! Package fetching for the isolated installer.
//!
//! The installer is generic over a [`PackageFetcher`] so the install,
//! timeout, and rollback machinery can be exercised without a network.
//! The production implementation downloads package archives from the LUMEN
//! registry and unpacks them into the staging directory it is handed.

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tar::Archive;

use crate::manifest::{PackageSpec, VersionConstraint};

/// Result of fetching one package into a staging directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPackage {
    pub name: String,
    /// Version actually delivered, when the source reports one.
    pub version: Option<String>,
    /// SHA-256 of the fetched archive, `sha256:<hex>`.
    pub checksum: String,
}

/// Source of package payloads. `fetch` must confine its writes to `dest`.
pub trait PackageFetcher: Send + Sync {
    fn fetch(&self, spec: &PackageSpec, dest: &Path) -> Result<FetchedPackage>;
}

/// Per-package metadata written beside the unpacked payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: Option<String>,
    pub checksum: String,
}

/// Fetches package archives from the LUMEN registry over HTTP.
pub struct RegistryPackageFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl RegistryPackageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: crate::config::registry_url(),
        }
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.to_string(),
        }
    }

    /// Version path segment for the download URL. Exact pins request that
    /// version; everything else asks the registry for the newest match.
    fn version_segment(spec: &PackageSpec) -> String {
        match &spec.constraint {
            VersionConstraint::Exact(v) => v.to_string(),
            _ => "latest".to_string(),
        }
    }
}

impl Default for RegistryPackageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageFetcher for RegistryPackageFetcher {
    fn fetch(&self, spec: &PackageSpec, dest: &Path) -> Result<FetchedPackage> {
        let url = format!(
            "{}/api/packages/{}/{}/download",
            self.base_url,
            spec.name,
            Self::version_segment(spec)
        );
        log::debug!("fetching {} from {}", spec.name, url);

        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("request failed for package '{}'", spec.name))?;

        if !response.status().is_success() {
            // A yanked package comes back as 410 Gone with a reason body.
            if response.status() == reqwest::StatusCode::GONE {
                let body = response.text().unwrap_or_default();
                let reason = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|j| j.get("reason").and_then(|v| v.as_str()).map(String::from))
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(anyhow!("package '{}' has been yanked: {}", spec.name, reason));
            }
            return Err(anyhow!(
                "package '{}' not found in registry (HTTP {})",
                spec.name,
                response.status()
            ));
        }

        let delivered_version = response
            .headers()
            .get("x-lumen-package-version")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let bytes = response
            .bytes()
            .with_context(|| format!("download failed for package '{}'", spec.name))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let checksum = format!("sha256:{:x}", hasher.finalize());

        let tar = GzDecoder::new(&bytes[..]);
        let mut archive = Archive::new(tar);
        archive
            .unpack(dest)
            .with_context(|| format!("failed to unpack package '{}'", spec.name))?;

        let fetched = FetchedPackage {
            name: spec.name.clone(),
            version: delivered_version,
            checksum,
        };

        let metadata = PackageMetadata {
            name: fetched.name.clone(),
            version: fetched.version.clone(),
            checksum: fetched.checksum.clone(),
        };
        fs::write(
            dest.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        Ok(fetched)
    }
}
