//! Builders for admission payloads shared by unit tests.

use kube::core::{
    admission::{AdmissionRequest, AdmissionReview},
    DynamicObject,
};
use serde_json::{json, Value};

pub fn review(
    uid: &str,
    (group, version, kind): (&str, &str, &str),
    resource: &str,
    operation: &str,
    namespace: &str,
    object: Value,
) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": group, "version": version, "kind": kind},
            "resource": {"group": group, "version": version, "resource": resource},
            "requestKind": {"group": group, "version": version, "kind": kind},
            "requestResource": {"group": group, "version": version, "resource": resource},
            "name": object["metadata"]["name"].as_str().unwrap_or_default(),
            "namespace": namespace,
            "operation": operation,
            "userInfo": {"username": "system:serviceaccount:kube-system:job-controller"},
            "object": object,
            "oldObject": null,
            "dryRun": false,
        }
    })
}

pub fn pod_review(operation: &str, namespace: &str, pod: Value) -> Value {
    review("pod-uid", ("", "v1", "Pod"), "pods", operation, namespace, pod)
}

pub fn job_review(uid: &str, operation: &str, job: Value) -> Value {
    review(uid, ("batch", "v1", "Job"), "jobs", operation, "ml", job)
}

pub fn request(review: Value) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(review).unwrap();
    review.try_into().unwrap()
}

pub fn object(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

pub fn pod(namespace: &str, images: &[&str], init_images: &[&str]) -> Value {
    let containers = |prefix: &str, images: &[&str]| -> Vec<Value> {
        images
            .iter()
            .enumerate()
            .map(|(i, image)| json!({"name": format!("{prefix}{i}"), "image": image}))
            .collect()
    };
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "web", "namespace": namespace},
        "spec": {
            "containers": containers("c", images),
            "initContainers": containers("init", init_images),
        }
    })
}

pub fn job(labels: Value, containers: Vec<Value>) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": "train", "namespace": "ml"},
        "spec": {
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": containers,
                }
            }
        }
    })
}

pub fn gpu_container(name: &str) -> Value {
    json!({
        "name": name,
        "image": "registry.local/trainer:1.0",
        "resources": {
            "requests": {"nvidia.com/gpu": "1", "cpu": "2"},
            "limits": {"nvidia.com/gpu": "1"},
        }
    })
}

pub fn cpu_container(name: &str) -> Value {
    json!({
        "name": name,
        "image": "registry.local/trainer:1.0",
        "resources": {"requests": {"cpu": "2"}}
    })
}

pub fn pipeline_labels() -> Value {
    json!({"app.uipath.com/component": "pipeline"})
}
