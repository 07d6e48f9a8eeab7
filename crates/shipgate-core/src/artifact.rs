//! Deployable bundle assembly.
//!
//! An artifact is a directory `<dist>/<name>-<version>/` holding the compiled
//! output, the legal metadata and a `manifest.json` listing every file with
//! its SHA-256 and size. The artifact digest is the hash of the manifest, so
//! two assemblies from the same inputs have the same digest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipgate_state::{write_atomic, ContentDigest};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::error::{Result, ShipgateError};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub files: Vec<ManifestEntry>,
}

/// Read-only handle to an assembled bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub version: Version,
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub digest: ContentDigest,
}

impl Artifact {
    pub const MANIFEST_FILE: &'static str = "manifest.json";
    pub const BOM_ENTRY: &'static str = "meta/bom.json";
    pub const LICENSES_ENTRY: &'static str = "meta/licenses.json";
    pub const LICENSE_ENTRY: &'static str = "meta/LICENSE";

    /// `<dist>/<name>-<version>`.
    pub fn dir_for(config: &PipelineConfig, version: &Version) -> PathBuf {
        config
            .resolve(&config.paths.dist_dir)
            .join(format!("{}-{}", config.project.name, version))
    }

    /// Open a previously assembled bundle.
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(Self::MANIFEST_FILE);
        let bytes = std::fs::read(&manifest_path).map_err(|e| {
            ShipgateError::Assembly(format!(
                "no assembled artifact at {}: {e}",
                dir.display()
            ))
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        let version = Version::parse(&manifest.version).map_err(ShipgateError::Assembly)?;
        Ok(Self {
            name: manifest.name.clone(),
            version,
            dir: dir.to_path_buf(),
            digest: ContentDigest::from_bytes(&bytes),
            manifest,
        })
    }

    pub fn lists(&self, entry: &str) -> bool {
        self.manifest.files.iter().any(|f| f.path == entry)
    }

    pub fn bom_path(&self) -> PathBuf {
        self.dir.join(Self::BOM_ENTRY)
    }

    /// The embedded application file, `app/<file name>`.
    pub fn app_entry(&self) -> Option<&ManifestEntry> {
        self.manifest.files.iter().find(|f| f.path.starts_with("app/"))
    }
}

/// Files combined into the bundle.
#[derive(Debug, Clone)]
pub struct AssemblyInputs {
    pub compiled_output: PathBuf,
    pub license_report: PathBuf,
    pub sbom: PathBuf,
    pub license_text: PathBuf,
}

impl AssemblyInputs {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            compiled_output: config.resolve(&config.paths.compiled_output),
            license_report: config.report_path("licenses.json"),
            sbom: config.report_path("bom.json"),
            license_text: config.resolve(&config.project.license_file),
        }
    }
}

pub struct ArtifactAssembler<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ArtifactAssembler<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Build (or refresh) the bundle for `version`.
    ///
    /// Every input is required. Files whose bytes are unchanged are left
    /// untouched and stale files from earlier assemblies are removed.
    pub fn assemble(&self, inputs: &AssemblyInputs, version: &Version) -> Result<Artifact> {
        let app_name = inputs
            .compiled_output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                ShipgateError::Assembly(format!(
                    "compiled output path has no file name: {}",
                    inputs.compiled_output.display()
                ))
            })?;

        let mut layout: Vec<(String, &Path)> = vec![
            (format!("app/{app_name}"), inputs.compiled_output.as_path()),
            (Artifact::LICENSES_ENTRY.to_string(), inputs.license_report.as_path()),
            (Artifact::BOM_ENTRY.to_string(), inputs.sbom.as_path()),
            (Artifact::LICENSE_ENTRY.to_string(), inputs.license_text.as_path()),
        ];
        for (entry, source) in &layout {
            if !source.is_file() {
                return Err(ShipgateError::Assembly(format!(
                    "required input for {entry} is missing: {}",
                    source.display()
                )));
            }
        }
        layout.sort_by(|a, b| a.0.cmp(&b.0));

        let dir = Artifact::dir_for(self.config, version);
        std::fs::create_dir_all(&dir)?;

        let mut files = Vec::with_capacity(layout.len());
        for (entry, source) in &layout {
            let bytes = std::fs::read(source)?;
            let target = dir.join(entry);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_if_changed(&target, &bytes)?;
            files.push(ManifestEntry {
                path: entry.clone(),
                sha256: hex::encode(Sha256::digest(&bytes)),
                size: bytes.len() as u64,
            });
        }

        let expected: BTreeSet<&str> = layout
            .iter()
            .map(|(e, _)| e.as_str())
            .chain(std::iter::once(Artifact::MANIFEST_FILE))
            .collect();
        remove_stale(&dir, &expected)?;

        let manifest = Manifest {
            name: self.config.project.name.clone(),
            version: version.to_string(),
            files,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        write_if_changed(&dir.join(Artifact::MANIFEST_FILE), &manifest_bytes)?;

        let artifact = Artifact {
            name: manifest.name.clone(),
            version: *version,
            dir,
            digest: ContentDigest::from_bytes(&manifest_bytes),
            manifest,
        };
        info!(
            artifact = %artifact.dir.display(),
            digest = %artifact.digest.short(),
            "artifact assembled"
        );
        Ok(artifact)
    }
}

fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<()> {
    if std::fs::read(path).ok().as_deref() == Some(bytes) {
        debug!(path = %path.display(), "unchanged, not rewritten");
        return Ok(());
    }
    write_atomic(path, bytes)?;
    Ok(())
}

fn remove_stale(dir: &Path, expected: &BTreeSet<&str>) -> Result<()> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if !expected.contains(rel.as_str()) {
            debug!(path = %entry.path().display(), "removing stale artifact file");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
