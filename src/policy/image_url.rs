use std::borrow::Cow;

use json_patch::{PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::core::{
    admission::{AdmissionRequest, Operation},
    DynamicObject,
};
use log::debug;
use serde_json::Value;

use super::{decode_workload, pointer, requested_kind, MutationPolicy};
use crate::Error;

/// Moves unqualified internal-registry images under a fixed registry namespace.
///
/// `registry.local/nginx:1.25` becomes `registry.local/<target>/nginx:1.25`;
/// images from other registries or already carrying a namespace are untouched.
#[derive(Clone, Debug)]
pub struct ImageUrlRewritePolicy {
    registry_prefix: String,
    target_namespace: String,
    allowed_namespaces: Vec<String>,
}

impl ImageUrlRewritePolicy {
    /// An empty `allowed_namespaces` admits pods from every namespace.
    pub fn new(
        registry_url: &str,
        target_namespace: impl Into<String>,
        allowed_namespaces: Vec<String>,
    ) -> Self {
        Self {
            registry_prefix: format!("{}/", registry_url.trim_end_matches('/')),
            target_namespace: target_namespace.into(),
            allowed_namespaces,
        }
    }

    pub fn rewrite_image<'a>(&self, image: &'a str) -> Cow<'a, str> {
        let Some(path) = image.strip_prefix(&self.registry_prefix) else {
            return Cow::Borrowed(image);
        };
        if path.is_empty() || path.contains('/') {
            return Cow::Borrowed(image);
        }
        Cow::Owned(format!(
            "{}{}/{path}",
            self.registry_prefix, self.target_namespace
        ))
    }

    fn namespace_allowed(&self, namespace: Option<&str>) -> bool {
        if self.allowed_namespaces.is_empty() {
            return true;
        }
        namespace
            .map(|ns| self.allowed_namespaces.iter().any(|x| x == ns))
            .unwrap_or_default()
    }

    fn rewrite_containers(
        &self,
        field: &str,
        containers: &[Container],
        patches: &mut Vec<PatchOperation>,
    ) {
        for (idx, container) in containers.iter().enumerate() {
            let Some(image) = container.image.as_deref() else {
                continue;
            };
            let rewritten = self.rewrite_image(image);
            if let Cow::Owned(new_image) = rewritten {
                debug!("rewriting image {image} -> {new_image}");
                patches.push(PatchOperation::Replace(ReplaceOperation {
                    path: pointer(["spec", field, &idx.to_string(), "image"]),
                    value: Value::String(new_image),
                }));
            }
        }
    }
}

impl MutationPolicy for ImageUrlRewritePolicy {
    fn name(&self) -> &'static str {
        "image-url-rewrite"
    }

    fn applies_to(&self, req: &AdmissionRequest<DynamicObject>) -> bool {
        let kind = requested_kind(req);
        let namespace = req.namespace.as_deref().or_else(|| {
            req.object
                .as_ref()
                .and_then(|x| x.metadata.namespace.as_deref())
        });
        req.operation == Operation::Create
            && kind.group.is_empty()
            && kind.version == "v1"
            && kind.kind == "Pod"
            && self.namespace_allowed(namespace)
    }

    fn apply(&self, workload: &DynamicObject) -> Result<Vec<PatchOperation>, Error> {
        let pod: Pod = decode_workload(workload)?;
        let Some(spec) = &pod.spec else {
            return Ok(vec![]);
        };

        let mut patches = vec![];
        self.rewrite_containers("containers", &spec.containers, &mut patches);
        if let Some(init) = &spec.init_containers {
            self.rewrite_containers("initContainers", init, &mut patches);
        }
        Ok(patches)
    }
}
