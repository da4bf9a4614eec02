//! Virtual path ↔ real path translation with symlink-escape checks.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use strum::IntoEnumIterator;

use super::error::{PathError, PathResult};
use super::types::{BaseCategory, Classification, Operations, VirtualPath};
use crate::error::{StorageError, StorageResult};

/// Upper bound on a directory probe; a hung network mount must not stall callers.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Real filesystem roots backing each base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRoots {
    pub home: PathBuf,
    pub apps: PathBuf,
    pub external: PathBuf,
    pub network: PathBuf,
}

impl BaseRoots {
    pub fn get(&self, base: BaseCategory) -> &Path {
        match base {
            BaseCategory::Home => &self.home,
            BaseCategory::Apps => &self.apps,
            BaseCategory::External => &self.external,
            BaseCategory::Network => &self.network,
        }
    }

    fn get_mut(&mut self, base: BaseCategory) -> &mut PathBuf {
        match base {
            BaseCategory::Home => &mut self.home,
            BaseCategory::Apps => &mut self.apps,
            BaseCategory::External => &mut self.external,
            BaseCategory::Network => &mut self.network,
        }
    }
}

/// Maps the virtual namespace onto real roots.
///
/// This is the gate every mutating file operation passes through:
/// [`PathResolver::check`] validates syntax, confirms the operation is
/// permitted for the path's classification, and resolves the real path
/// while refusing anything that escapes its base root through a symlink.
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: BaseRoots,
}

impl PathResolver {
    /// Create a resolver over the given roots.
    ///
    /// Roots are canonicalized at construction time so containment checks
    /// compare like with like (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(roots: BaseRoots) -> Self {
        let mut canonical = roots;
        for base in BaseCategory::iter() {
            let root = canonical.get_mut(base);
            if let Ok(c) = root.canonicalize() {
                *root = c;
            }
        }
        Self { roots: canonical }
    }

    pub fn roots(&self) -> &BaseRoots {
        &self.roots
    }

    /// Real root of a base.
    pub fn root(&self, base: BaseCategory) -> &Path {
        self.roots.get(base)
    }

    /// Classify a virtual path. Pure: no filesystem access.
    pub fn classify(&self, path: &str) -> PathResult<Classification> {
        Ok(VirtualPath::parse(path)?.classify())
    }

    /// Resolve a virtual path to a real path inside its base root.
    ///
    /// The path need not exist. Every existing component is resolved through
    /// symlinks and the result must stay under the base's real root; a
    /// dangling symlink anywhere along the way is treated as an escape.
    pub fn resolve(&self, path: &str) -> PathResult<PathBuf> {
        let vp = VirtualPath::parse(path)?;
        self.resolve_parsed(&vp)
    }

    /// Resolve an already-parsed virtual path.
    pub fn resolve_parsed(&self, vp: &VirtualPath) -> PathResult<PathBuf> {
        let root = self.root(vp.base());
        let mut full = root.to_path_buf();
        for seg in vp.segments() {
            full.push(seg);
        }
        let canonical = canonicalize_existing_prefix(&full)?;
        if !canonical.starts_with(root) {
            return Err(PathError::path_escapes_root(format!(
                "{} is not under {}",
                vp,
                root.display()
            )));
        }
        Ok(canonical)
    }

    /// Validate `path` for `ops` and resolve it.
    ///
    /// Returns `OperationNotAllowed` for malformed paths, traversal, symlink
    /// escape, or a classification that forbids any of `ops`.
    pub fn check(&self, path: &str, ops: Operations) -> StorageResult<(VirtualPath, PathBuf)> {
        let vp = VirtualPath::parse(path)?;
        let class = vp.classify();
        if !class.allows(ops) {
            let denied = ops - class.allowed;
            return Err(StorageError::not_allowed(format!(
                "{} on {}",
                denied.names().join("|").to_lowercase(),
                vp
            )));
        }
        let real = self.resolve_parsed(&vp)?;
        Ok((vp, real))
    }

    /// Translate a real path back into the virtual namespace.
    ///
    /// Works for paths that no longer exist (delete events), by matching
    /// the canonical roots lexically first.
    pub fn to_virtual(&self, real: &Path) -> PathResult<VirtualPath> {
        if let Some(vp) = self.match_roots(real) {
            return Ok(vp);
        }
        if let Ok(canonical) = real.canonicalize() {
            if let Some(vp) = self.match_roots(&canonical) {
                return Ok(vp);
            }
        }
        Err(PathError::OutsideRoots(real.display().to_string()))
    }

    fn match_roots(&self, real: &Path) -> Option<VirtualPath> {
        let mut best: Option<(BaseCategory, &Path)> = None;
        for base in BaseCategory::iter() {
            let root = self.root(base);
            if real.starts_with(root)
                && best.is_none_or(|(_, b)| root.as_os_str().len() > b.as_os_str().len())
            {
                best = Some((base, root));
            }
        }
        let (base, root) = best?;
        let rel = real.strip_prefix(root).ok()?;

        let mut segments = Vec::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(s) => segments.push(s.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(VirtualPath::from_parts(base, segments))
    }

    /// Whether `vp` currently resolves to an existing directory.
    ///
    /// Runs on the blocking pool with a timeout, so a stat against a dead
    /// network mount reads as "not a directory" instead of hanging.
    pub async fn is_directory(&self, vp: &VirtualPath) -> bool {
        let resolver = self.clone();
        let vp = vp.clone();
        let probe = tokio::task::spawn_blocking(move || {
            resolver
                .resolve_parsed(&vp)
                .map(|real| real.is_dir())
                .unwrap_or(false)
        });
        matches!(tokio::time::timeout(PROBE_TIMEOUT, probe).await, Ok(Ok(true)))
    }
}

/// Canonicalize the deepest existing ancestor of `full` and re-append the rest.
fn canonicalize_existing_prefix(full: &Path) -> PathResult<PathBuf> {
    let mut existing = full.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for name in tail.iter().rev() {
                    canonical.push(name);
                }
                return Ok(canonical);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if existing.symlink_metadata().is_ok() {
                    return Err(PathError::path_escapes_root(format!(
                        "dangling symlink at {}",
                        existing.display()
                    )));
                }
                let name = existing
                    .file_name()
                    .ok_or_else(|| PathError::invalid_path(full.display().to_string()))?
                    .to_os_string();
                tail.push(name);
                if !existing.pop() {
                    return Err(PathError::invalid_path(full.display().to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
