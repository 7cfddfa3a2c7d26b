use std::{convert::Infallible, sync::Arc};

use base64::{prelude::BASE64_STANDARD, Engine};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::{api::PatchParams, Api, Client};
use log::{error, info, warn};
use serde_json::{json, Value};
use warp::{
    http::StatusCode,
    hyper::body::Bytes,
    reply::{self, Reply, Response},
    Filter, Rejection,
};

use crate::{certs::CertificateMaterial, config::Config, pipeline::AdmissionPipeline, Error};

const FIELD_MANAGER: &str = "workload-mutator";

/// Applies the MutatingWebhookConfiguration trusting `material`'s root.
pub async fn prepare_webhook(
    client: Client,
    config: &Config,
    namespace: &str,
    material: &CertificateMaterial,
) -> Result<(), Error> {
    let Some(name) = config.webhook_config_name.as_deref() else {
        return Ok(());
    };
    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    let input = api.get_opt(name).await?;
    let target: MutatingWebhookConfiguration =
        serde_json::from_value(webhook(name, config, namespace, material))
            .map_err(|e| Error::Config(format!("invalid webhook config: {e:?}")))?;
    if input.as_ref().map(|x| &x.webhooks) != Some(&target.webhooks) {
        info!("applying MutatingWebhookConfiguration {name}");
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &kube::api::Patch::Apply(target),
        )
        .await?;
    }
    Ok(())
}

fn webhook(name: &str, config: &Config, namespace: &str, material: &CertificateMaterial) -> Value {
    let client_config = json!({
        "caBundle": BASE64_STANDARD.encode(&material.root_cert_pem),
        "service": {
            "name": &config.service_name,
            "namespace": namespace,
            "path": "/mutate",
            "port": config.service_port,
        },
    });
    let entry = |prefix: &str, rule: Value| {
        json!({
            "admissionReviewVersions": ["v1"],
            "clientConfig": &client_config,
            "name": format!("{prefix}.{}.{namespace}.svc", config.service_name),
            "failurePolicy": "Ignore",
            "matchPolicy": "Equivalent",
            "reinvocationPolicy": "Never",
            "rules": [rule],
            "sideEffects": "None",
            "timeoutSeconds": 10,
        })
    };

    let mut webhooks = vec![];
    if let Some(image) = &config.image_rewrite {
        let mut hook = entry(
            "images",
            json!({
                "apiGroups": [""],
                "apiVersions": ["v1"],
                "operations": ["CREATE"],
                "resources": ["pods"],
                "scope": "Namespaced",
            }),
        );
        if !image.allowed_namespaces.is_empty() {
            hook["namespaceSelector"] = json!({
                "matchExpressions": [{
                    "key": "kubernetes.io/metadata.name",
                    "operator": "In",
                    "values": &image.allowed_namespaces,
                }]
            });
        }
        webhooks.push(hook);
    }
    if config.mig.is_some() {
        webhooks.push(entry(
            "mig",
            json!({
                "apiGroups": ["batch"],
                "apiVersions": ["v1"],
                "operations": ["CREATE"],
                "resources": ["jobs"],
                "scope": "Namespaced",
            }),
        ));
    }

    json!({
        "apiVersion": "admissionregistration.k8s.io/v1",
        "kind": "MutatingWebhookConfiguration",
        "metadata": {
            "labels": {
                "app": &config.service_name,
            },
            "name": name,
        },
        "webhooks": webhooks,
    })
}

pub fn routes(
    pipeline: Arc<AdmissionPipeline>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::path("mutate").or(warp::path("webhook")).unify())
        .and(warp::path::end())
        .and(warp::body::bytes())
        .and(warp::any().map(move || pipeline.clone()))
        .and_then(mutate_handler)
}

pub async fn run_webhook(
    material: &CertificateMaterial,
    pipeline: Arc<AdmissionPipeline>,
    config: &Config,
) -> Result<(), Error> {
    info!(
        "webhook listening on {} with policies {:?}",
        config.bind,
        pipeline.policy_names()
    );

    warp::serve(routes(pipeline).with(warp::log::log("webhook")))
        .tls()
        .cert(&material.leaf_cert_pem)
        .key(&material.leaf_key_pem)
        .run(config.bind)
        .await;

    Ok(())
}

async fn mutate_handler(
    body: Bytes,
    pipeline: Arc<AdmissionPipeline>,
) -> Result<Response, Infallible> {
    match pipeline.review(&body) {
        Ok(review) => Ok(reply::json(&review).into_response()),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!("admission request failed: {e}");
            } else {
                warn!("invalid admission request: {e}");
            }
            Ok(reply::with_status(e.public_message(), status).into_response())
        }
    }
}
