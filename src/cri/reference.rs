//! Image reference normalization
//!
//! Runtimes report the same image under several spellings (`nginx`,
//! `nginx:latest`, `docker.io/library/nginx:latest`, a repo digest, the bare
//! image id). Every comparison in the crate goes through [`normalize`] so the
//! spellings collapse to one canonical form.

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_NAMESPACE: &str = "library/";
const DEFAULT_TAG: &str = "latest";
const ID_PREFIX: &str = "sha256:";

/// Canonical form of an image reference
///
/// - image ids keep (or gain) the `sha256:` prefix and are lowercased
/// - names get the default registry and `library/` namespace
/// - tagless names get `:latest`; digested names keep only the digest
pub fn normalize(reference: &str) -> String {
    let reference = reference.trim();

    if let Some(hex) = reference.strip_prefix(ID_PREFIX) {
        return format!("{ID_PREFIX}{}", hex.to_ascii_lowercase());
    }
    if is_bare_id(reference) {
        return format!("{ID_PREFIX}{}", reference.to_ascii_lowercase());
    }

    if let Some((name, digest)) = reference.split_once('@') {
        let (name, _tag) = split_tag(name);
        return format!("{}@{}", qualify(name), digest.to_ascii_lowercase());
    }

    let (name, tag) = split_tag(reference);
    format!("{}:{}", qualify(name), tag.unwrap_or(DEFAULT_TAG))
}

fn is_bare_id(reference: &str) -> bool {
    reference.len() == 64 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Split `name[:tag]`; a colon before the last `/` belongs to a registry port
fn split_tag(reference: &str) -> (&str, Option<&str>) {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(offset) => {
            let colon = last_slash + offset;
            (&reference[..colon], Some(&reference[colon + 1..]))
        }
        None => (reference, None),
    }
}

fn qualify(name: &str) -> String {
    let (domain, remainder) = match name.split_once('/') {
        Some((first, rest)) if looks_like_domain(first) => (first, rest.to_string()),
        _ => (DEFAULT_DOMAIN, name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN
    } else {
        domain
    };

    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        format!("{domain}/{OFFICIAL_NAMESPACE}{remainder}")
    } else {
        format!("{domain}/{remainder}")
    }
}

fn looks_like_domain(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
