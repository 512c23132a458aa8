//! Manifest data model: the per-product `VersionInfo` document describing the
//! target file tree and available patches, and the per-patch
//! `IncrementalPatchInfo` document describing before/after file signatures.
//!
//! Both are plain JSON. Callers may install a [`ManifestVerifier`] hook that
//! inspects (and may rewrite) the raw text before deserialization, e.g. to
//! strip and check a detached signature.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::version::VersionCode;

pub const COMPRESSED_FILE_EXTENSION: &str = ".zst";
pub const PATCH_FILE_EXTENSION: &str = ".patch";
pub const PATCH_INFO_EXTENSION: &str = ".info";
pub const VERSION_INFO_FILENAME: &str = "VersionInfo.json";
pub const INSTALLER_FILENAME: &str = "installer.snapshot";

/// Hook invoked on raw manifest text before deserialization; returning false
/// fails the run with a signature-verification error.
pub type ManifestVerifier = Box<dyn Fn(&mut String) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: VersionCode,
    #[serde(default)]
    pub base_download_url: String,
    #[serde(default)]
    pub maintenance_check_url: String,
    #[serde(default)]
    pub ignored_paths: Vec<String>,
    #[serde(default)]
    pub files: Vec<VersionItem>,
    #[serde(default)]
    pub patches: Vec<IncrementalPatch>,
    #[serde(default)]
    pub installer: Option<InstallerPatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionItem {
    /// Forward-slash relative path inside the install root.
    pub path: String,
    pub file_size: u64,
    /// Hex BLAKE3 of the file contents.
    pub hash: String,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub compressed_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalPatch {
    pub from: VersionCode,
    pub to: VersionCode,
    pub file_count: u32,
    pub patch_size: u64,
    pub patch_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerPatch {
    pub patch_size: u64,
    pub patch_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementalPatchInfo {
    #[serde(default)]
    pub renamed_files: Vec<PatchRenamedItem>,
    #[serde(default)]
    pub files: Vec<PatchItem>,
}

/// A pure rename carried by an incremental patch (no content change).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRenamedItem {
    pub before_path: String,
    pub after_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchItem {
    pub path: String,
    /// 0 means the file is new in this patch and is shipped whole.
    pub before_size: u64,
    #[serde(default)]
    pub before_hash: String,
    pub after_size: u64,
    pub after_hash: String,
}

impl IncrementalPatch {
    /// `from_to` label used in default file names and URLs.
    pub fn label(&self) -> String {
        format!("{}_{}", self.from, self.to)
    }
}

impl VersionInfo {
    pub fn from_json(text: &str) -> Result<VersionInfo, PatchError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<VersionInfo, PatchError> {
        let text = std::fs::read_to_string(path)?;
        VersionInfo::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn item_download_url(&self, item: &VersionItem) -> Option<String> {
        if let Some(url) = &item.download_url {
            return Some(url.clone());
        }
        if !self.base_download_url.is_empty() {
            return Some(format!(
                "{}{}{}",
                self.base_download_url, item.path, COMPRESSED_FILE_EXTENSION
            ));
        }
        None
    }

    pub fn patch_download_url(&self, patch: &IncrementalPatch) -> Option<String> {
        if let Some(url) = &patch.download_url {
            return Some(url.clone());
        }
        if !self.base_download_url.is_empty() {
            return Some(format!(
                "{}{}{}",
                self.base_download_url,
                patch.label(),
                PATCH_FILE_EXTENSION
            ));
        }
        None
    }

    pub fn patch_info_url(&self, patch: &IncrementalPatch) -> Option<String> {
        if let Some(url) = &patch.info_url {
            return Some(url.clone());
        }
        if !self.base_download_url.is_empty() {
            return Some(format!(
                "{}{}{}",
                self.base_download_url,
                patch.label(),
                PATCH_INFO_EXTENSION
            ));
        }
        None
    }

    pub fn installer_download_url(&self) -> Option<String> {
        let installer = self.installer.as_ref()?;
        if let Some(url) = &installer.download_url {
            return Some(url.clone());
        }
        if !self.base_download_url.is_empty() {
            return Some(format!("{}{}", self.base_download_url, INSTALLER_FILENAME));
        }
        None
    }

    /// Walk the patch list once from `installed`, chaining `from -> to` links.
    /// The chain is valid only if it ends exactly at this manifest's version;
    /// any gap discards the whole chain.
    pub fn resolve_patch_chain(&self, installed: &VersionCode) -> Vec<&IncrementalPatch> {
        let mut chain = Vec::new();
        let mut at = installed.clone();

        for patch in &self.patches {
            if at == self.version {
                break;
            }
            if at == patch.from {
                at = patch.to.clone();
                chain.push(patch);
            }
        }

        if at != self.version {
            chain.clear();
        }
        chain
    }

    /// Compiled ignore patterns, including the built-in ones for the version
    /// marker and self-patch bookkeeping files.
    pub fn ignore_patterns(&self) -> Vec<glob::Pattern> {
        let mut patterns = Vec::with_capacity(self.ignored_paths.len() + 1);
        for raw in &self.ignored_paths {
            if let Ok(pattern) = glob::Pattern::new(raw) {
                patterns.push(pattern);
            }
        }
        // Never treat the installed-version marker as obsolete.
        if let Ok(pattern) = glob::Pattern::new("*.version") {
            patterns.push(pattern);
        }
        patterns
    }
}

pub fn path_is_ignored(patterns: &[glob::Pattern], relative_path: &str) -> bool {
    patterns.iter().any(|p| p.matches(relative_path))
}

impl IncrementalPatchInfo {
    pub fn from_json(text: &str) -> Result<IncrementalPatchInfo, PatchError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(from: &str, to: &str) -> IncrementalPatch {
        IncrementalPatch {
            from: VersionCode::parse(from),
            to: VersionCode::parse(to),
            file_count: 1,
            patch_size: 10,
            patch_hash: "00".into(),
            info_url: None,
            download_url: None,
        }
    }

    fn info_with(version: &str, patches: Vec<IncrementalPatch>) -> VersionInfo {
        VersionInfo {
            name: "demo".into(),
            version: VersionCode::parse(version),
            base_download_url: "https://updates.example.com/demo/".into(),
            maintenance_check_url: String::new(),
            ignored_paths: Vec::new(),
            files: Vec::new(),
            patches,
            installer: None,
        }
    }

    #[test]
    fn chain_resolves_contiguous_prefix() {
        let info = info_with(
            "1.2",
            vec![patch("1.0", "1.1"), patch("1.1", "1.2"), patch("1.3", "1.4")],
        );
        let chain = info.resolve_patch_chain(&VersionCode::parse("1.0"));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].to, VersionCode::parse("1.2"));
    }

    #[test]
    fn gap_invalidates_whole_chain() {
        let info = info_with(
            "1.4",
            vec![patch("1.0", "1.1"), patch("1.1", "1.2"), patch("1.3", "1.4")],
        );
        assert!(info
            .resolve_patch_chain(&VersionCode::parse("1.0"))
            .is_empty());
    }

    #[test]
    fn already_at_target_yields_empty_chain_without_clearing() {
        let info = info_with("1.1", vec![patch("1.0", "1.1")]);
        assert!(info
            .resolve_patch_chain(&VersionCode::parse("1.1"))
            .is_empty());
    }

    #[test]
    fn url_defaulting_from_base() {
        let mut info = info_with("1.1", vec![patch("1.0", "1.1")]);
        let item = VersionItem {
            path: "bin/app".into(),
            file_size: 1,
            hash: "aa".into(),
            compressed_size: 1,
            compressed_hash: "bb".into(),
            download_url: None,
        };
        assert_eq!(
            info.item_download_url(&item).unwrap(),
            "https://updates.example.com/demo/bin/app.zst"
        );
        assert_eq!(
            info.patch_download_url(&info.patches[0]).unwrap(),
            "https://updates.example.com/demo/1.0_1.1.patch"
        );
        assert_eq!(
            info.patch_info_url(&info.patches[0]).unwrap(),
            "https://updates.example.com/demo/1.0_1.1.info"
        );

        info.base_download_url = String::new();
        assert!(info.item_download_url(&item).is_none());
    }

    #[test]
    fn ignored_paths_and_builtin_marker_pattern() {
        let mut info = info_with("1.0", Vec::new());
        info.ignored_paths = vec!["logs/*".into(), "*.tmp".into()];
        let patterns = info.ignore_patterns();

        assert!(path_is_ignored(&patterns, "logs/today.txt"));
        assert!(path_is_ignored(&patterns, "cache/a.tmp"));
        assert!(path_is_ignored(&patterns, "demo.version"));
        assert!(!path_is_ignored(&patterns, "bin/app"));
    }
}
