use json_patch::PatchOperation;
use kube::core::{admission::AdmissionRequest, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;

use crate::Error;

pub mod image_url;
pub mod mig;

pub use image_url::ImageUrlRewritePolicy;
pub use mig::MigResourceRewritePolicy;

/// A pure rewrite of one workload into JSON-Patch operations.
///
/// Implementations hold only immutable configuration, perform no I/O and never
/// modify the object they are given. An empty fragment means "nothing to do".
pub trait MutationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the request's kind, operation and namespace are handled at all.
    fn applies_to(&self, req: &AdmissionRequest<DynamicObject>) -> bool;

    fn apply(&self, workload: &DynamicObject) -> Result<Vec<PatchOperation>, Error>;
}

/// Escapes one JSON pointer reference token (RFC 6901).
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Joins reference tokens into a JSON pointer, escaping each one.
pub fn pointer<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .fold(String::new(), |mut out, segment| {
            out.push('/');
            out.push_str(&escape_segment(segment.as_ref()));
            out
        })
}

/// Reads the admission object as a typed workload.
pub fn decode_workload<K: DeserializeOwned>(workload: &DynamicObject) -> Result<K, Error> {
    serde_json::to_value(workload)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::MalformedRequest(format!("object is not a valid workload: {e}")))
}

/// The kind the client originally asked for, falling back to the converted kind.
pub fn requested_kind(req: &AdmissionRequest<DynamicObject>) -> &GroupVersionKind {
    req.request_kind.as_ref().unwrap_or(&req.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_slash_and_tilde() {
        assert_eq!(escape_segment("nvidia.com/gpu"), "nvidia.com~1gpu");
        assert_eq!(escape_segment("a~b"), "a~0b");
        // `~` must be escaped first so `/` -> `~1` is not re-escaped.
        assert_eq!(escape_segment("~/"), "~0~1");
        assert_eq!(escape_segment("plain"), "plain");
    }

    #[test]
    fn builds_pointer() {
        assert_eq!(
            pointer(["spec", "containers", "0", "resources", "limits", "nvidia.com/gpu"]),
            "/spec/containers/0/resources/limits/nvidia.com~1gpu"
        );
        assert_eq!(pointer(Vec::<String>::new()), "");
    }
}
