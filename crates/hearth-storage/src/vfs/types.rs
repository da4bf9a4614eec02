//! Virtual path types: bases, parsed paths, allowed operations.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use super::error::{PathError, PathResult};

/// Top-level category of the virtual namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
pub enum BaseCategory {
    /// User data.
    Home,
    /// Installed-application data.
    Apps,
    /// Attached removable media.
    External,
    /// Remote network mounts.
    Network,
}

bitflags! {
    /// Set of operations a virtual path permits.
    ///
    /// Every operation is evaluated against its target path: `CREATE` means
    /// "create a new entry at exactly this path".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Operations: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRASH = 1 << 3;
        const DELETE = 1 << 4;
        const MOVE = 1 << 5;
        const RENAME = 1 << 6;
        const FAVORITE = 1 << 7;
        const SHARE = 1 << 8;

        /// Operations that detach an entry from its parent.
        const DETACH = Self::TRASH.bits()
            | Self::DELETE.bits()
            | Self::MOVE.bits()
            | Self::RENAME.bits();
    }
}

impl Operations {
    /// Operation names, for error messages.
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names()
            .filter(|(name, _)| *name != "DETACH")
            .map(|(name, _)| name)
            .collect()
    }
}

/// Result of classifying a virtual path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub base: BaseCategory,
    pub allowed: Operations,
}

impl Classification {
    /// Whether every operation in `ops` is permitted.
    pub fn allows(&self, ops: Operations) -> bool {
        self.allowed.contains(ops)
    }
}

/// A syntactically valid virtual path: a base plus zero or more segments.
///
/// Construction rejects empty and relative paths and any `.` or `..`
/// segment, so a `VirtualPath` can be joined onto its base root lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    base: BaseCategory,
    segments: Vec<String>,
}

impl VirtualPath {
    /// Parse a virtual path string like `/Home/photos/2024`.
    pub fn parse(path: &str) -> PathResult<Self> {
        if path.is_empty() {
            return Err(PathError::invalid_path("empty path"));
        }
        if !path.starts_with('/') {
            return Err(PathError::invalid_path(format!("relative path: {path}")));
        }
        if path.contains('\0') {
            return Err(PathError::invalid_path("path contains NUL"));
        }

        let mut parts = path.split('/').filter(|s| !s.is_empty());
        let base_str = parts
            .next()
            .ok_or_else(|| PathError::invalid_path(format!("no base in {path}")))?;

        let mut segments = Vec::new();
        for seg in std::iter::once(base_str).chain(parts) {
            if seg == "." || seg == ".." {
                return Err(PathError::Traversal(path.to_string()));
            }
            segments.push(seg.to_string());
        }

        let base = BaseCategory::from_str(&segments[0])
            .map_err(|_| PathError::UnknownBase(segments[0].clone()))?;
        segments.remove(0);

        Ok(Self { base, segments })
    }

    /// Build from a base and already-validated segments.
    pub(crate) fn from_parts(base: BaseCategory, segments: Vec<String>) -> Self {
        Self { base, segments }
    }

    pub fn base(&self) -> BaseCategory {
        self.base
    }

    /// Segments below the base.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments below the base (`/Home` is 0).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, or the base name for a base root.
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map(String::as_str)
            .unwrap_or_else(|| self.base.as_ref())
    }

    /// Whether `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &VirtualPath) -> bool {
        self.base == other.base
            && self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Compute the operations this path permits. Pure; touches no filesystem.
    pub fn classify(&self) -> Classification {
        let depth = self.depth();
        let mut allowed = Operations::all();

        // Base roots are fixed points of the namespace.
        if depth == 0 {
            allowed -= Operations::DETACH | Operations::CREATE;
        }

        match self.base {
            BaseCategory::Home => {}
            BaseCategory::Apps | BaseCategory::External => {
                allowed -= Operations::FAVORITE | Operations::SHARE;
            }
            BaseCategory::Network => {
                allowed -= Operations::SHARE;
                // /Network, /Network/<host>, /Network/<host>/<share>
                if depth <= 2 {
                    allowed -= Operations::DETACH | Operations::CREATE;
                }
                if depth < 2 {
                    allowed -= Operations::WRITE;
                }
            }
        }

        Classification {
            base: self.base,
            allowed,
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.base)?;
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl FromStr for VirtualPath {
    type Err = PathError;

    fn from_str(s: &str) -> PathResult<Self> {
        Self::parse(s)
    }
}
