use serde::{Deserialize, Serialize};

/// Version is a monotonically increasing build counter. Every `evaluate()` call runs at
/// a version one greater than the previous call.
///
/// `Version::NEVER` orders before every real build and marks nodes that were never
/// evaluated or changed.
///
/// # Examples
///
/// ```
/// # use memograph::Version;
/// let first = Version::NEVER.next();
/// assert_eq!(first, Version(1));
/// assert!(first.is_newer_than(Version::NEVER));
/// assert!(Version(7).is_within_window(Version(10), 3));
/// assert!(!Version(6).is_within_window(Version(10), 3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// The version of something that never happened.
    pub const NEVER: Version = Version(0);

    /// The version following this one.
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// Returns true if this version is strictly newer than `other`.
    pub fn is_newer_than(self, other: Version) -> bool {
        self.0 > other.0
    }

    /// Returns true if this version is at most `window` builds older than `current`.
    pub fn is_within_window(self, current: Version, window: u64) -> bool {
        self.0.saturating_add(window) >= current.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}
