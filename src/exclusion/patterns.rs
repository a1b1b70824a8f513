//! Operator-supplied exclusion list
//!
//! Images whose alias matches one of these glob patterns are never removed,
//! whatever the request selector says. Patterns are matched against the
//! normalized alias and against the alias as the runtime reported it.

use crate::cri::{reference, Image};
use glob::{Pattern, PatternError};

#[derive(Debug, Clone, Default)]
pub struct ExclusionPatterns {
    patterns: Vec<Pattern>,
}

impl ExclusionPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches_reference(&self, image_ref: &str) -> bool {
        let normalized = reference::normalize(image_ref);
        self.patterns
            .iter()
            .any(|p| p.matches(image_ref) || p.matches(&normalized))
    }

    pub fn matches(&self, image: &Image) -> bool {
        image
            .repo_tags
            .iter()
            .chain(&image.repo_digests)
            .chain(std::iter::once(&image.id))
            .any(|r| self.matches_reference(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_wildcard() {
        let patterns = ExclusionPatterns::new(&["registry.k8s.io/*"]).unwrap();
        let pause = Image::new("sha256:9").with_tag("registry.k8s.io/pause:3.9");
        let nginx = Image::new("sha256:1").with_tag("nginx:latest");
        assert!(patterns.matches(&pause));
        assert!(!patterns.matches(&nginx));
    }

    #[test]
    fn test_short_name_pattern_matches_normalized_alias() {
        let patterns = ExclusionPatterns::new(&["docker.io/library/nginx:*"]).unwrap();
        assert!(patterns.matches_reference("nginx"));
        assert!(patterns.matches_reference("nginx:1.25"));
        assert!(!patterns.matches_reference("redis"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ExclusionPatterns::new(&["[unclosed"]).is_err());
    }
}
