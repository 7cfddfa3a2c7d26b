use std::panic::{self, AssertUnwindSafe};

use base64::{prelude::BASE64_STANDARD, Engine};
use json_patch::{Patch, PatchOperation};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, META_KIND},
    DynamicObject,
};
use log::{debug, info};
use serde_json::Value;

use crate::{
    config::Config,
    policy::{ImageUrlRewritePolicy, MigResourceRewritePolicy, MutationPolicy},
    Error,
};

/// Decodes admission reviews and runs them through the registered policies.
///
/// Policies run in registration order and their fragments are concatenated.
/// The pipeline never denies: any outcome other than an error is `allowed`.
pub struct AdmissionPipeline {
    policies: Vec<Box<dyn MutationPolicy>>,
}

impl AdmissionPipeline {
    pub fn new(policies: Vec<Box<dyn MutationPolicy>>) -> Self {
        Self { policies }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut policies: Vec<Box<dyn MutationPolicy>> = vec![];
        if let Some(image) = &config.image_rewrite {
            policies.push(Box::new(ImageUrlRewritePolicy::new(
                &image.registry_url,
                image.target_namespace.clone(),
                image.allowed_namespaces.clone(),
            )));
        }
        if let Some(mig) = &config.mig {
            let policy = MigResourceRewritePolicy::new(
                &mig.profile,
                mig.pipeline_label.clone(),
                &mig.gpu_resource,
            );
            info!(
                "pipeline jobs requesting {} will be moved to {}",
                mig.gpu_resource,
                policy.mig_resource()
            );
            policies.push(Box::new(policy));
        }
        Self::new(policies)
    }

    pub fn policy_names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|x| x.name()).collect()
    }

    /// Handles one raw AdmissionReview body, returning the response envelope as sent on the wire.
    pub fn review(&self, body: &[u8]) -> Result<Value, Error> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedRequest(format!("invalid admission review: {e}")))?;
        if review.types.kind != META_KIND {
            return Err(Error::UnexpectedKind(review.types.kind));
        }
        let req: AdmissionRequest<DynamicObject> = review
            .try_into()
            .map_err(|e| Error::MalformedRequest(format!("{e}")))?;
        encode_review(self.mutate(&req)?.into_review())
    }

    pub fn mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Error> {
        let res = AdmissionResponse::from(req);
        let Some(obj) = &req.object else {
            return Ok(res);
        };

        let mut patches: Vec<PatchOperation> = vec![];
        for policy in &self.policies {
            let fragment = panic::catch_unwind(AssertUnwindSafe(|| {
                if policy.applies_to(req) {
                    policy.apply(obj).map(Some)
                } else {
                    Ok(None)
                }
            }))
            .map_err(|payload| {
                Error::PolicyFault(format!(
                    "policy {} panicked: {}",
                    policy.name(),
                    panic_message(payload.as_ref())
                ))
            })??;
            let Some(fragment) = fragment else {
                continue;
            };
            debug!(
                "{} produced {} operations for {}",
                policy.name(),
                fragment.len(),
                req.uid
            );
            patches.extend(fragment);
        }

        info!(
            "accepted: {:?} on {} {}/{} with {} patch operations",
            req.operation,
            req.kind.kind,
            req.namespace.as_deref().unwrap_or_default(),
            req.name,
            patches.len()
        );
        if patches.is_empty() {
            return Ok(res);
        }
        Ok(res.with_patch(Patch(patches))?)
    }
}

/// `AdmissionResponse` serializes `patch` as a byte array; the API server expects base64.
fn encode_review(review: AdmissionReview<DynamicObject>) -> Result<Value, Error> {
    let patch = review
        .response
        .as_ref()
        .and_then(|x| x.patch.as_deref())
        .map(|x| BASE64_STANDARD.encode(x));
    let mut value = serde_json::to_value(&review)?;
    if let Some(patch) = patch {
        value["response"]["patch"] = Value::String(patch);
    }
    Ok(value)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
