use crate::cri::{reference, Image};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wildcard entry that turns an image list into "all unused"
pub const ALL_IMAGES: &str = "*";

/// Which images a cleanup request targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageSelector {
    /// Every image not backing a container
    #[default]
    AllUnused,
    /// Only these references (normalized)
    Images(BTreeSet<String>),
}

impl ImageSelector {
    /// Build a selector from an image list; a `*` entry selects everything
    pub fn from_list<I, S>(references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut images = BTreeSet::new();
        for r in references {
            let r = r.as_ref().trim();
            if r == ALL_IMAGES {
                return ImageSelector::AllUnused;
            }
            if !r.is_empty() {
                images.insert(reference::normalize(r));
            }
        }
        ImageSelector::Images(images)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ImageSelector::AllUnused)
    }

    /// Whether `image` is in scope under any of its aliases
    pub fn selects(&self, image: &Image) -> bool {
        match self {
            ImageSelector::AllUnused => true,
            ImageSelector::Images(wanted) => image.aliases().iter().any(|a| wanted.contains(a)),
        }
    }
}

impl std::fmt::Display for ImageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSelector::AllUnused => write!(f, "all unused images"),
            ImageSelector::Images(images) => {
                let list: Vec<&str> = images.iter().map(String::as_str).collect();
                write!(f, "{}", list.join(", "))
            }
        }
    }
}
