//! Release version resolution.
//!
//! The next version is derived from the highest release tag plus a bump
//! chosen by markers in the triggering commit message. Major beats minor
//! beats patch. A commit that already carries a release tag resolves to
//! that release, so re-running on the same commit never mints a new
//! version. The result is persisted through a [`VersionStore`] so later
//! stages (and later CLI invocations) read the same value.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shipgate_state::VersionStore;
use tracing::{debug, info};

use crate::config::VersionConfig;
use crate::error::{Result, ShipgateError};

/// Immutable MAJOR.MINOR.PATCH triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `1.2.3`, tolerating a leading `v`.
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("'{input}' is not MAJOR.MINOR.PATCH"));
        }
        let num = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| format!("'{input}' has a non-numeric component '{s}'"))
        };
        Ok(Self::new(num(parts[0])?, num(parts[1])?, num(parts[2])?))
    }

    /// Apply a bump policy. `None` if the bumped component overflows.
    pub fn bump(self, kind: BumpKind) -> Option<Self> {
        match kind {
            BumpKind::Major => Some(Self::new(self.major.checked_add(1)?, 0, 0)),
            BumpKind::Minor => Some(Self::new(self.major, self.minor.checked_add(1)?, 0)),
            BumpKind::Patch => Some(Self::new(self.major, self.minor, self.patch.checked_add(1)?)),
        }
    }

    /// Tag form, e.g. `v1.2.3`.
    pub fn tag(&self, prefix: &str) -> String {
        format!("{prefix}{self}")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// Increment policy selected from the commit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
}

impl BumpKind {
    /// Pick the bump from markers present in `message`.
    pub fn from_commit_message(message: &str, major_marker: &str, minor_marker: &str) -> Self {
        if !major_marker.is_empty() && message.contains(major_marker) {
            BumpKind::Major
        } else if !minor_marker.is_empty() && message.contains(minor_marker) {
            BumpKind::Minor
        } else {
            BumpKind::Patch
        }
    }
}

/// Source of release tags and the triggering commit.
pub trait TagSource: Send + Sync {
    /// All tag names starting with `prefix`. Errors mean the history is unreadable.
    fn list_tags(&self, prefix: &str) -> Result<Vec<String>>;

    /// Tags starting with `prefix` that point at the triggering commit.
    fn tags_at_head(&self, prefix: &str) -> Result<Vec<String>>;

    /// Full message of the triggering commit.
    fn head_commit_message(&self) -> Result<String>;

    /// Create an annotated release tag at HEAD.
    fn create_tag(&self, tag: &str, message: &str) -> Result<()>;
}

/// [`TagSource`] backed by the `git` executable.
pub struct GitTagSource {
    repo_dir: PathBuf,
}

impl GitTagSource {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|e| ShipgateError::VersionResolution(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShipgateError::VersionResolution(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn tag_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl TagSource for GitTagSource {
    fn list_tags(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        Ok(tag_lines(&self.git(&["tag", "--list", &pattern])?))
    }

    fn tags_at_head(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        Ok(tag_lines(&self.git(&["tag", "--points-at", "HEAD", "--list", &pattern])?))
    }

    fn head_commit_message(&self) -> Result<String> {
        self.git(&["log", "-1", "--format=%B"])
    }

    fn create_tag(&self, tag: &str, message: &str) -> Result<()> {
        self.git(&["tag", "-a", tag, "-m", message]).map(|_| ())
    }
}

/// Outcome of a resolution, kept for logging and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    pub version: Version,
    pub previous: Option<Version>,
    pub bump: Option<BumpKind>,
    pub reset: bool,
    /// HEAD already carries this release tag; nothing new to release.
    #[serde(default)]
    pub already_tagged: bool,
}

/// Computes and persists the run's version.
pub struct VersioningService<'a> {
    config: &'a VersionConfig,
    tags: &'a dyn TagSource,
    store: &'a dyn VersionStore,
}

impl<'a> VersioningService<'a> {
    pub fn new(
        config: &'a VersionConfig,
        tags: &'a dyn TagSource,
        store: &'a dyn VersionStore,
    ) -> Self {
        Self {
            config,
            tags,
            store,
        }
    }

    fn highest(&self, tags: Vec<String>) -> Option<Version> {
        let prefix = self.config.tag_prefix.as_str();
        tags.iter()
            .filter_map(|tag| tag.strip_prefix(prefix))
            .filter_map(|rest| Version::parse(rest).ok())
            .max()
    }

    /// Highest parseable release tag, `None` for an empty history.
    pub fn latest_release(&self) -> Result<Option<Version>> {
        Ok(self.highest(self.tags.list_tags(&self.config.tag_prefix)?))
    }

    /// Compute the next version without persisting it.
    pub fn compute(&self) -> Result<ResolvedVersion> {
        if let Some(reset) = &self.config.reset_to {
            let version = Version::parse(reset).map_err(ShipgateError::VersionResolution)?;
            info!(%version, "version explicitly reset");
            return Ok(ResolvedVersion {
                version,
                previous: None,
                bump: None,
                reset: true,
                already_tagged: false,
            });
        }

        // Bumps only apply to commits made since the last release.
        if let Some(version) = self.highest(self.tags.tags_at_head(&self.config.tag_prefix)?) {
            info!(%version, "HEAD is already a tagged release");
            return Ok(ResolvedVersion {
                version,
                previous: Some(version),
                bump: None,
                reset: false,
                already_tagged: true,
            });
        }

        let previous = self.latest_release()?;
        let Some(previous) = previous else {
            let version =
                Version::parse(&self.config.start_from).map_err(ShipgateError::VersionResolution)?;
            debug!(%version, "no release tags yet, starting from configured version");
            return Ok(ResolvedVersion {
                version,
                previous: None,
                bump: None,
                reset: false,
                already_tagged: false,
            });
        };

        let message = self.tags.head_commit_message()?;
        let bump = BumpKind::from_commit_message(
            &message,
            &self.config.major_marker,
            &self.config.minor_marker,
        );
        let version = previous.bump(bump).ok_or_else(|| {
            ShipgateError::VersionResolution(format!("cannot apply {bump:?} bump to {previous}"))
        })?;
        Ok(ResolvedVersion {
            version,
            previous: Some(previous),
            bump: Some(bump),
            reset: false,
            already_tagged: false,
        })
    }

    /// Persist a resolution for downstream stages and later invocations.
    pub fn persist(&self, resolved: &ResolvedVersion) -> Result<()> {
        self.store.save(&resolved.version.tag("v"))?;
        info!(
            version = %resolved.version,
            previous = ?resolved.previous.map(|v| v.to_string()),
            bump = ?resolved.bump,
            already_tagged = resolved.already_tagged,
            "resolved release version"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipgate_state::fakes::MemoryVersionStore;
    use std::sync::Mutex;

    /// Scripted tag history. Created tags land at HEAD and in later listings.
    struct FakeTags {
        broken: Option<String>,
        listed: Mutex<Vec<String>>,
        head: Mutex<Vec<String>>,
        message: String,
    }

    impl FakeTags {
        fn new(tags: &[&str], message: &str) -> Self {
            Self {
                broken: None,
                listed: Mutex::new(tags.iter().map(|t| t.to_string()).collect()),
                head: Mutex::new(Vec::new()),
                message: message.to_string(),
            }
        }

        fn check(&self) -> Result<()> {
            match &self.broken {
                Some(e) => Err(ShipgateError::VersionResolution(e.clone())),
                None => Ok(()),
            }
        }
    }

    impl TagSource for FakeTags {
        fn list_tags(&self, prefix: &str) -> Result<Vec<String>> {
            self.check()?;
            let listed = self.listed.lock().unwrap();
            Ok(listed.iter().filter(|t| t.starts_with(prefix)).cloned().collect())
        }

        fn tags_at_head(&self, prefix: &str) -> Result<Vec<String>> {
            self.check()?;
            let head = self.head.lock().unwrap();
            Ok(head.iter().filter(|t| t.starts_with(prefix)).cloned().collect())
        }

        fn head_commit_message(&self) -> Result<String> {
            Ok(self.message.clone())
        }

        fn create_tag(&self, tag: &str, _message: &str) -> Result<()> {
            self.listed.lock().unwrap().push(tag.to_string());
            self.head.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    fn compute(tags: &FakeTags, config: &VersionConfig) -> Result<ResolvedVersion> {
        let store = MemoryVersionStore::new();
        VersioningService::new(config, tags, &store).compute()
    }

    #[test]
    fn patch_bump_without_marker() {
        let tags = FakeTags::new(&["v1.4.2", "v1.3.9"], "Fix flaky import");
        let resolved = compute(&tags, &VersionConfig::default()).unwrap();
        assert_eq!(resolved.version, Version::new(1, 4, 3));
        assert_eq!(resolved.bump, Some(BumpKind::Patch));
        assert!(!resolved.already_tagged);
    }

    #[test]
    fn minor_marker_resets_patch() {
        let tags = FakeTags::new(&["v1.4.2"], "Add alias support {minor}");
        let resolved = compute(&tags, &VersionConfig::default()).unwrap();
        assert_eq!(resolved.version.to_string(), "1.5.0");
    }

    #[test]
    fn major_marker_wins_over_minor() {
        let tags = FakeTags::new(&["v1.4.2"], "{minor} and {major}");
        let resolved = compute(&tags, &VersionConfig::default()).unwrap();
        assert_eq!(resolved.version.to_string(), "2.0.0");
    }

    #[test]
    fn highest_tag_is_used_not_latest_listed() {
        let tags = FakeTags::new(&["v1.10.0", "v1.9.7", "v1.2.0", "vnext"], "chore");
        let resolved = compute(&tags, &VersionConfig::default()).unwrap();
        assert_eq!(resolved.previous, Some(Version::new(1, 10, 0)));
        assert_eq!(resolved.version, Version::new(1, 10, 1));
    }

    #[test]
    fn tagged_head_resolves_to_its_own_release() {
        let tags = FakeTags::new(&["v1.4.2"], "fix");
        let config = VersionConfig::default();
        let store = MemoryVersionStore::new();
        let service = VersioningService::new(&config, &tags, &store);

        let first = service.compute().unwrap();
        assert_eq!(first.version, Version::new(1, 4, 3));
        tags.create_tag(&first.version.tag("v"), "Release 1.4.3").unwrap();

        let again = service.compute().unwrap();
        assert_eq!(again.version, Version::new(1, 4, 3));
        assert!(again.already_tagged);
        assert_eq!(again.bump, None);
    }

    #[test]
    fn bump_overflow_is_a_resolution_error() {
        let tags = FakeTags::new(&[&format!("v1.2.{}", u64::MAX)], "fix");
        let err = compute(&tags, &VersionConfig::default()).unwrap_err();
        assert!(matches!(err, ShipgateError::VersionResolution(_)));
        assert_eq!(Version::new(u64::MAX, 0, 0).bump(BumpKind::Major), None);
    }

    #[test]
    fn empty_history_starts_from_configured_version() {
        let tags = FakeTags::new(&[], "initial");
        let resolved = compute(&tags, &VersionConfig::default()).unwrap();
        assert_eq!(resolved.version, Version::new(0, 0, 1));
        assert_eq!(resolved.previous, None);
    }

    #[test]
    fn unreadable_history_is_fatal() {
        let mut tags = FakeTags::new(&[], "");
        tags.broken = Some("not a git repository".to_string());
        let err = compute(&tags, &VersionConfig::default()).unwrap_err();
        assert!(matches!(err, ShipgateError::VersionResolution(_)));
    }

    #[test]
    fn explicit_reset_overrides_history() {
        let tags = FakeTags::new(&["v3.0.0"], "{major}");
        let config = VersionConfig {
            reset_to: Some("2.0.0".to_string()),
            ..VersionConfig::default()
        };
        let resolved = compute(&tags, &config).unwrap();
        assert_eq!(resolved.version, Version::new(2, 0, 0));
        assert!(resolved.reset);
    }

    #[test]
    fn resolved_version_is_persisted_with_prefix() {
        let tags = FakeTags::new(&["v0.1.0"], "x");
        let store = MemoryVersionStore::new();
        let config = VersionConfig::default();
        let service = VersioningService::new(&config, &tags, &store);
        let resolved = service.compute().unwrap();
        service.persist(&resolved).unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("v0.1.1"));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(Version::parse("v2.0.0").unwrap(), Version::new(2, 0, 0));
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("1.2.x").is_err());
        assert!(Version::new(1, 10, 0) > Version::new(1, 9, 9));
    }
}
