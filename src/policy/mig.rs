use std::{collections::BTreeMap, fmt, str::FromStr};

use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use k8s_openapi::{
    api::{batch::v1::Job, core::v1::ResourceRequirements},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::core::{
    admission::{AdmissionRequest, Operation},
    DynamicObject,
};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{decode_workload, pointer, requested_kind, MutationPolicy};
use crate::Error;

lazy_static! {
    static ref MIG_PROFILE: Regex = Regex::new(r"^mig-[0-9]g\.[0-9][0-9]gb$").unwrap();
}

pub const DEFAULT_PIPELINE_LABEL: &str = "app.uipath.com/component=pipeline";
pub const DEFAULT_GPU_RESOURCE: &str = "nvidia.com/gpu";

/// A MIG slice name such as `mig-1g.10gb`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigProfile(String);

impl FromStr for MigProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !MIG_PROFILE.is_match(s) {
            return Err(Error::Config(format!(
                "MIG resource '{s}' does not match the format mig-<n>g.<nn>gb"
            )));
        }
        Ok(MigProfile(s.to_string()))
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An equality label selector, `key=value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMatch {
    pub key: String,
    pub value: String,
}

impl FromStr for LabelMatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(LabelMatch {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            }),
            _ => Err(Error::Config(format!(
                "label selector '{s}' is not of the form key=value"
            ))),
        }
    }
}

impl LabelMatch {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        labels.and_then(|x| x.get(&self.key)) == Some(&self.value)
    }
}

/// Swaps whole-GPU requests on pipeline Jobs for a single MIG slice.
#[derive(Clone, Debug)]
pub struct MigResourceRewritePolicy {
    pipeline_label: LabelMatch,
    gpu_resource: String,
    mig_resource: String,
}

impl MigResourceRewritePolicy {
    /// The MIG resource is published under the same vendor domain as `gpu_resource`.
    pub fn new(profile: &MigProfile, pipeline_label: LabelMatch, gpu_resource: &str) -> Self {
        let mig_resource = match gpu_resource.split_once('/') {
            Some((vendor, _)) => format!("{vendor}/{profile}"),
            None => profile.to_string(),
        };
        Self {
            pipeline_label,
            gpu_resource: gpu_resource.to_string(),
            mig_resource,
        }
    }

    pub fn mig_resource(&self) -> &str {
        &self.mig_resource
    }

    fn holds_gpu(&self, map: Option<&BTreeMap<String, Quantity>>) -> bool {
        map.map(|x| x.contains_key(&self.gpu_resource))
            .unwrap_or_default()
    }

    fn rewrite_container(
        &self,
        idx: usize,
        resources: &ResourceRequirements,
        patches: &mut Vec<PatchOperation>,
    ) {
        let idx = idx.to_string();
        let sections = [
            ("requests", resources.requests.as_ref()),
            ("limits", resources.limits.as_ref()),
        ];
        let base = ["spec", "template", "spec", "containers", idx.as_str(), "resources"];
        let path = |tail: &[&str]| pointer(base.iter().chain(tail));

        for (section, map) in sections {
            let op = match map {
                Some(_) => AddOperation {
                    path: path(&[section, self.mig_resource.as_str()]),
                    value: json!("1"),
                },
                None => AddOperation {
                    path: path(&[section]),
                    value: Value::Object(Map::from_iter([(
                        self.mig_resource.clone(),
                        json!("1"),
                    )])),
                },
            };
            patches.push(PatchOperation::Add(op));
        }
        for (section, map) in sections {
            if self.holds_gpu(map) {
                patches.push(PatchOperation::Remove(RemoveOperation {
                    path: path(&[section, self.gpu_resource.as_str()]),
                }));
            }
        }
    }
}

impl MutationPolicy for MigResourceRewritePolicy {
    fn name(&self) -> &'static str {
        "mig-resource-rewrite"
    }

    fn applies_to(&self, req: &AdmissionRequest<DynamicObject>) -> bool {
        let kind = requested_kind(req);
        req.operation == Operation::Create
            && kind.group == "batch"
            && kind.version == "v1"
            && kind.kind == "Job"
    }

    fn apply(&self, workload: &DynamicObject) -> Result<Vec<PatchOperation>, Error> {
        let job: Job = decode_workload(workload)?;
        let Some(template) = job.spec.map(|x| x.template) else {
            return Ok(vec![]);
        };
        let labels = template.metadata.as_ref().and_then(|x| x.labels.as_ref());
        if !self.pipeline_label.matches(labels) {
            debug!("job is not a pipeline, skipping MIG rewrite");
            return Ok(vec![]);
        }

        let mut patches = vec![];
        let containers = template.spec.map(|x| x.containers).unwrap_or_default();
        for (idx, container) in containers.iter().enumerate() {
            let Some(resources) = &container.resources else {
                continue;
            };
            if self.holds_gpu(resources.requests.as_ref())
                || self.holds_gpu(resources.limits.as_ref())
            {
                self.rewrite_container(idx, resources, &mut patches);
            }
        }
        if patches.is_empty() {
            debug!("pipeline job requests no {}, skipping MIG rewrite", self.gpu_resource);
        }
        Ok(patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn policy() -> MigResourceRewritePolicy {
        MigResourceRewritePolicy::new(
            &"mig-1g.10gb".parse().unwrap(),
            DEFAULT_PIPELINE_LABEL.parse().unwrap(),
            DEFAULT_GPU_RESOURCE,
        )
    }

    fn apply(job: Value) -> Value {
        let patches = policy().apply(&testutil::object(job)).unwrap();
        serde_json::to_value(patches).unwrap()
    }

    #[test]
    fn profile_validation() {
        for valid in ["mig-1g.10gb", "mig-7g.80gb", "mig-0g.00gb", "mig-3g.20gb"] {
            assert!(valid.parse::<MigProfile>().is_ok(), "{valid}");
        }
        for invalid in [
            "",
            "mig-1g.5gb",
            "mig-10g.10gb",
            "1g.10gb",
            "mig-1g.10gbx",
            "nvidia.com/mig-1g.10gb",
            "mig-1gx10gb",
        ] {
            assert!(
                matches!(invalid.parse::<MigProfile>(), Err(Error::Config(_))),
                "{invalid}"
            );
        }
    }

    #[test]
    fn label_match_parsing() {
        let label: LabelMatch = "app.uipath.com/component=pipeline".parse().unwrap();
        assert_eq!(label.key, "app.uipath.com/component");
        assert_eq!(label.value, "pipeline");
        assert!("novalue".parse::<LabelMatch>().is_err());
        assert!("=x".parse::<LabelMatch>().is_err());
    }

    #[test]
    fn mig_resource_shares_gpu_vendor() {
        assert_eq!(policy().mig_resource(), "nvidia.com/mig-1g.10gb");
        let bare = MigResourceRewritePolicy::new(
            &"mig-2g.20gb".parse().unwrap(),
            DEFAULT_PIPELINE_LABEL.parse().unwrap(),
            "gpu",
        );
        assert_eq!(bare.mig_resource(), "mig-2g.20gb");
    }

    #[test]
    fn non_pipeline_job_is_untouched() {
        let job = testutil::job(json!({"app": "web"}), vec![testutil::gpu_container("c")]);
        assert_eq!(apply(job), json!([]));
    }

    #[test]
    fn cpu_pipeline_is_untouched() {
        let job = testutil::job(testutil::pipeline_labels(), vec![testutil::cpu_container("c")]);
        assert_eq!(apply(job), json!([]));
    }

    #[test]
    fn gpu_pipeline_gets_four_ops() {
        let job = testutil::job(testutil::pipeline_labels(), vec![testutil::gpu_container("c")]);
        assert_eq!(
            apply(job),
            json!([
                {"op": "add", "path": "/spec/template/spec/containers/0/resources/requests/nvidia.com~1mig-1g.10gb", "value": "1"},
                {"op": "add", "path": "/spec/template/spec/containers/0/resources/limits/nvidia.com~1mig-1g.10gb", "value": "1"},
                {"op": "remove", "path": "/spec/template/spec/containers/0/resources/requests/nvidia.com~1gpu"},
                {"op": "remove", "path": "/spec/template/spec/containers/0/resources/limits/nvidia.com~1gpu"},
            ])
        );
    }

    #[test]
    fn targets_the_gpu_container_by_index() {
        let job = testutil::job(
            testutil::pipeline_labels(),
            vec![testutil::cpu_container("sidecar"), testutil::gpu_container("trainer")],
        );
        let patches = apply(job);
        let paths: Vec<&str> = patches
            .as_array()
            .unwrap()
            .iter()
            .map(|x| x["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths.len(), 4);
        assert!(paths
            .iter()
            .all(|x| x.starts_with("/spec/template/spec/containers/1/")));
    }

    #[test]
    fn missing_limits_map_is_created() {
        let container = json!({
            "name": "c",
            "image": "trainer",
            "resources": {"requests": {"nvidia.com/gpu": "1"}},
        });
        let job = testutil::job(testutil::pipeline_labels(), vec![container]);
        assert_eq!(
            apply(job),
            json!([
                {"op": "add", "path": "/spec/template/spec/containers/0/resources/requests/nvidia.com~1mig-1g.10gb", "value": "1"},
                {"op": "add", "path": "/spec/template/spec/containers/0/resources/limits", "value": {"nvidia.com/mig-1g.10gb": "1"}},
                {"op": "remove", "path": "/spec/template/spec/containers/0/resources/requests/nvidia.com~1gpu"},
            ])
        );
    }

    #[test]
    fn output_is_deterministic() {
        let job = testutil::job(testutil::pipeline_labels(), vec![testutil::gpu_container("c")]);
        assert_eq!(apply(job.clone()), apply(job));
    }

    #[test]
    fn applies_only_to_job_creates() {
        let policy = policy();
        let job = testutil::job(testutil::pipeline_labels(), vec![]);
        let create = testutil::request(testutil::job_review("u", "CREATE", job.clone()));
        assert!(policy.applies_to(&create));
        let update = testutil::request(testutil::job_review("u", "UPDATE", job));
        assert!(!policy.applies_to(&update));

        let pod = testutil::pod("ml", &["trainer"], &[]);
        let pod = testutil::request(testutil::pod_review("CREATE", "ml", pod));
        assert!(!policy.applies_to(&pod));
    }
}
