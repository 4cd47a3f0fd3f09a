//! Port blacklist
//!
//! Some tty devices are never worth probing: virtual consoles, the pty
//! multiplexer, input devices and USB gadget ports. Writing the identify
//! command to them is at best useless and at worst disruptive.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::DetectError;

/// Ports skipped by default
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "/dev/input/**",
    "/dev/ptmx",
    "/dev/console",
    "/dev/tty",
    "/dev/ttyprintk",
    "/dev/tty[0-9]*",
    "/dev/ttyGS*",
];

/// Matches port paths that detection must leave alone
#[derive(Debug, Clone)]
pub struct PortFilter {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PortFilter {
    /// Build a filter from explicit patterns only
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, DetectError> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| DetectError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        let set = builder.build().map_err(|e| DetectError::InvalidPattern {
            pattern: kept.join(", "),
            reason: e.to_string(),
        })?;
        Ok(Self {
            patterns: kept,
            set,
        })
    }

    /// Build a filter from the default blacklist plus `extra` patterns
    pub fn with_defaults<S: AsRef<str>>(extra: &[S]) -> Result<Self, DetectError> {
        let mut patterns: Vec<&str> = DEFAULT_BLACKLIST.to_vec();
        patterns.extend(extra.iter().map(AsRef::as_ref));
        Self::new(&patterns)
    }

    /// A filter that matches nothing
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    /// Check whether `port` must not be probed
    pub fn is_blacklisted(&self, port: &str) -> bool {
        self.set.is_match(port)
    }

    /// Patterns in effect
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for PortFilter {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_blacklist() {
        let filter = PortFilter::with_defaults::<&str>(&[]).unwrap();
        assert!(filter.is_blacklisted("/dev/ptmx"));
        assert!(filter.is_blacklisted("/dev/tty"));
        assert!(filter.is_blacklisted("/dev/tty7"));
        assert!(filter.is_blacklisted("/dev/ttyGS0"));
        assert!(filter.is_blacklisted("/dev/input/event3"));
        assert!(filter.is_blacklisted("/dev/input/by-id/usb-kbd"));

        assert!(!filter.is_blacklisted("/dev/ttyACM0"));
        assert!(!filter.is_blacklisted("/dev/ttyUSB1"));
        assert!(!filter.is_blacklisted("/dev/ttyS0"));
        assert!(!filter.is_blacklisted("COM_TEST"));
    }

    #[test]
    fn test_extra_patterns() {
        let filter = PortFilter::with_defaults(&["/dev/ttyUSB*"]).unwrap();
        assert!(filter.is_blacklisted("/dev/ttyUSB0"));
        assert!(!filter.is_blacklisted("/dev/ttyACM0"));
        assert_eq!(filter.patterns().len(), DEFAULT_BLACKLIST.len() + 1);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            PortFilter::new(&["/dev/[tty"]),
            Err(DetectError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_empty_filter() {
        assert!(!PortFilter::empty().is_blacklisted("/dev/ptmx"));
    }
}
