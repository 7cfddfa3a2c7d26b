#![warn(clippy::dbg_macro, clippy::todo)]

mod cert_store;
mod certs;
mod config;
mod pipeline;
mod policy;
#[cfg(test)]
mod testutil;
mod webhook;

use std::sync::Arc;

use cert_store::SecretBackedCertStore;
use certs::CertificateAuthority;
use config::Config;
use k8s_openapi::api::core::v1::Secret;
use kube::{client::Client, core::admission::SerializePatchError, Api};
use log::{error, info};
use pipeline::AdmissionPipeline;
use warp::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error("Failed to generate certificate: {0}")]
    CryptoGeneration(#[from] rcgen::Error),
    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(#[source] kube::Error),
    #[error("Corrupt credential record: {0}")]
    CorruptRecord(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Malformed admission request: {0}")]
    MalformedRequest(String),
    #[error("Unexpected admission envelope kind: {0}")]
    UnexpectedKind(String),
    #[error("Mutation policy failed: {0}")]
    PolicyFault(String),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("Failed to serialize admission review: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_) | Error::UnexpectedKind(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body for a failed request; details stay in the server log.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::MalformedRequest(_) => "malformed admission review",
            Error::UnexpectedKind(_) => "unexpected kind, expected AdmissionReview",
            _ => "internal error",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), kube::Error> {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = match Config::from_env() {
        Ok(x) => x,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let client = Client::try_default().await?;
    let namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());

    let store = SecretBackedCertStore::new(
        Api::<Secret>::namespaced(client.clone(), &namespace),
        config.secret_name.clone(),
        namespace.clone(),
        CertificateAuthority::new(config.service_name.clone(), namespace.clone()),
    );
    let certificate = match store.load_or_create().await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to create/load webhook TLS cert: {e}");
            std::process::exit(1);
        }
    };
    match certificate.root_fingerprint() {
        Ok(fp) => info!("webhook CA sha256 fingerprint {fp}"),
        Err(e) => {
            error!("failed to fingerprint webhook CA: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = webhook::prepare_webhook(client, &config, &namespace, &certificate).await {
        error!("failed to apply webhook config: {e}");
        std::process::exit(1);
    }

    let pipeline = Arc::new(AdmissionPipeline::from_config(&config));
    if let Err(e) = webhook::run_webhook(&certificate, pipeline, &config).await {
        error!("webhook failed to run: {e}");
        std::process::exit(1);
    }
    error!("webhook terminated");
    Ok(())
}
