//! Exclusion Resolver
//!
//! Computes, from live runtime data, the set of image references that must
//! never be removed from a node: every alias of every image backing a
//! created, running or unknown-state container. The set is rebuilt for every
//! pipeline run and never cached.

pub mod patterns;

pub use patterns::ExclusionPatterns;

use crate::cri::{reference, Container, Image};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    references: BTreeSet<String>,
}

impl ExclusionSet {
    /// Resolve the exclusion set for one node
    ///
    /// `containers` is the node's full container list; `images` is its image
    /// inventory, used to expand each pinned reference to all of its aliases.
    pub fn resolve(containers: &[Container], images: &[Image]) -> Self {
        let pinned: BTreeSet<String> = containers
            .iter()
            .filter(|c| c.state.pins_image())
            .flat_map(|c| c.image_references())
            .map(reference::normalize)
            .collect();

        let mut references = pinned.clone();
        for image in images {
            let aliases = image.aliases();
            if !aliases.is_disjoint(&pinned) {
                references.extend(aliases);
            }
        }

        Self { references }
    }

    #[cfg(test)]
    pub fn contains(&self, image_ref: &str) -> bool {
        self.references.contains(&reference::normalize(image_ref))
    }

    /// Whether any alias of `image` is excluded
    pub fn covers(&self, image: &Image) -> bool {
        image
            .aliases()
            .iter()
            .any(|alias| self.references.contains(alias))
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::ContainerState;

    fn nginx() -> Image {
        Image::new("sha256:1111")
            .with_tag("docker.io/library/nginx:latest")
            .with_tag("docker.io/library/nginx:1.25")
            .with_digest("docker.io/library/nginx@sha256:aaaa")
    }

    #[test]
    fn test_running_container_pins_every_alias() {
        let containers = vec![Container::new("c1", "nginx:1.25", ContainerState::Running)];
        let set = ExclusionSet::resolve(&containers, &[nginx()]);

        assert!(set.contains("nginx:latest"));
        assert!(set.contains("sha256:1111"));
        assert!(set.contains("docker.io/library/nginx@sha256:aaaa"));
        assert!(set.covers(&nginx()));
    }

    #[test]
    fn test_container_reporting_only_digest_pins_tags() {
        let containers = vec![Container::new(
            "c1",
            "docker.io/library/nginx@sha256:aaaa",
            ContainerState::Created,
        )];
        let set = ExclusionSet::resolve(&containers, &[nginx()]);
        assert!(set.contains("nginx"));
    }

    #[test]
    fn test_exited_containers_do_not_pin() {
        let containers = vec![Container::new("c1", "nginx:latest", ContainerState::Exited)];
        let set = ExclusionSet::resolve(&containers, &[nginx()]);
        assert!(set.is_empty());
        assert!(!set.covers(&nginx()));
    }

    #[test]
    fn test_unknown_state_fails_closed() {
        let containers = vec![
            Container::new("c1", "busybox", ContainerState::Unknown).with_image_id("sha256:1111"),
        ];
        let set = ExclusionSet::resolve(&containers, &[nginx()]);
        assert!(set.contains("busybox:latest"));
        assert!(set.covers(&nginx()));
    }

    #[test]
    fn test_pinned_reference_without_local_image_is_kept() {
        let containers = vec![Container::new("c1", "redis:7", ContainerState::Running)];
        let set = ExclusionSet::resolve(&containers, &[]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["docker.io/library/redis:7"]);
    }
}
