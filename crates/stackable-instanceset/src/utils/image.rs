//! Comparison of container image references.
//!
//! The image reported in a container status is often normalized by the container runtime, e.g.
//! `nginx` is reported as `docker.io/library/nginx:latest@sha256:...`. An image is therefore
//! considered to match if every component which is present on both sides agrees.

use k8s_openapi::api::core::v1::Pod;

/// A parsed image reference of the form `[registry/]repository[:tag][@digest]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageReference<'a> {
    pub registry: Option<&'a str>,
    pub repository: &'a str,
    pub tag: Option<&'a str>,
    pub digest: Option<&'a str>,
}

impl<'a> ImageReference<'a> {
    pub fn parse(image: &'a str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest)),
            None => (image, None),
        };

        // A colon before the last slash belongs to the registry port, not to the tag
        let (name, tag) = match rest.rfind(':') {
            Some(colon) if rest.rfind('/').is_none_or(|slash| colon > slash) => {
                (&rest[..colon], Some(&rest[colon + 1..]))
            }
            _ => (rest, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, repository)) if is_registry_host(host) => (Some(host), repository),
            _ => (None, name),
        };

        Self {
            registry,
            repository,
            tag: tag.filter(|tag| !tag.is_empty()),
            digest: digest.filter(|digest| !digest.is_empty()),
        }
    }

    /// Returns whether both references could denote the same image.
    pub fn matches(&self, other: &ImageReference<'_>) -> bool {
        fn agree(a: Option<&str>, b: Option<&str>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        agree(
            self.registry.map(normalize_registry),
            other.registry.map(normalize_registry),
        ) && repositories_match(self.repository, other.repository)
            && agree(self.tag, other.tag)
            && agree(self.digest, other.digest)
    }
}

fn is_registry_host(host: &str) -> bool {
    host.contains('.') || host.contains(':') || host == "localhost"
}

fn normalize_registry(registry: &str) -> &str {
    match registry {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        registry => registry,
    }
}

/// The shorter repository path must be a suffix of the longer one, so that `nginx` matches
/// `library/nginx`.
fn repositories_match(a: &str, b: &str) -> bool {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.is_empty() {
        return false;
    }

    longer == shorter
        || longer
            .strip_suffix(shorter)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

/// Compares the image requested for a container with the image reported by the runtime.
pub fn is_image_matched(spec_image: &str, status_image: &str) -> bool {
    ImageReference::parse(spec_image).matches(&ImageReference::parse(status_image))
}

/// Returns whether every container of the Pod runs the image requested in its spec.
///
/// Containers are matched by name. Containers without a reported status are not compared, as the
/// runtime has not pulled an image for them yet.
pub fn is_pod_image_matched(pod: &Pod) -> bool {
    let (Some(spec), Some(status)) = (&pod.spec, &pod.status) else {
        return true;
    };
    let container_statuses = status.container_statuses.as_deref().unwrap_or_default();

    spec.containers.iter().all(|container| {
        let Some(status) = container_statuses
            .iter()
            .find(|status| status.name == container.name)
        else {
            return true;
        };

        match container.image.as_deref() {
            Some(image) => is_image_matched(image, &status.image),
            None => true,
        }
    })
}
