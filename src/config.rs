use std::{net::SocketAddr, path::Path};

use serde::Deserialize;

use crate::{
    policy::mig::{LabelMatch, MigProfile, DEFAULT_GPU_RESOURCE, DEFAULT_PIPELINE_LABEL},
    Error,
};

const DEFAULT_BIND: &str = "0.0.0.0:8443";
const DEFAULT_SERVICE: &str = "workload-mutator";
const DEFAULT_SECRET_NAME: &str = "workload-mutator-tls";
const DEFAULT_TARGET_REGISTRY_NAMESPACE: &str = "default";
const DEFAULT_ALLOWED_NAMESPACES: &str = "default,istio-system";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRewriteConfig {
    pub registry_url: String,
    pub target_namespace: String,
    pub allowed_namespaces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigConfig {
    pub profile: MigProfile,
    pub pipeline_label: LabelMatch,
    pub gpu_resource: String,
}

/// Process-wide settings, read once before serving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    /// `None` means the kube client's default namespace.
    pub namespace: Option<String>,
    pub service_name: String,
    /// Port of the Service fronting the pods, which may differ from `bind`.
    pub service_port: u16,
    pub secret_name: String,
    pub webhook_config_name: Option<String>,
    pub image_rewrite: Option<ImageRewriteConfig>,
    pub mig: Option<MigConfig>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    admission_bind: Option<String>,
    deployment_namespace: Option<String>,
    webhook_service: Option<String>,
    webhook_service_port: Option<u16>,
    webhook_secret_name: Option<String>,
    webhook_config_name: Option<String>,
    registry_url: Option<String>,
    target_registry_namespace: Option<String>,
    allowed_namespaces: Option<Vec<String>>,
    mig_resource: Option<String>,
    pipeline_label: Option<String>,
    gpu_resource: Option<String>,
    classic_du: Option<ClassicDu>,
}

#[derive(Deserialize, Default, Debug)]
struct ClassicDu {
    resource: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Config(format!("invalid config file {}: {e}", path.display()))
        })
    }
}

impl Config {
    /// Reads the environment, layered over the JSON file named by `MUTATOR_CONFIG`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let env = |key: &str| lookup(key).filter(|x| !x.trim().is_empty());
        let file = match env("MUTATOR_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let bind = env("ADMISSION_BIND")
            .or(file.admission_bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind
            .parse()
            .map_err(|e| Error::Config(format!("invalid ADMISSION_BIND ({bind}): {e}")))?;

        let service_port = match env("WEBHOOK_SERVICE_PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                Error::Config(format!("invalid WEBHOOK_SERVICE_PORT ({raw}): {e}"))
            })?,
            None => file.webhook_service_port.unwrap_or(bind.port()),
        };

        let registry_url = env("REGISTRY_URL").or(file.registry_url);
        let image_rewrite = match registry_url {
            Some(registry_url) => {
                let allowed_namespaces = match env("ALLOWED_NAMESPACES") {
                    Some(raw) => split_list(&raw),
                    None => file
                        .allowed_namespaces
                        .unwrap_or_else(|| split_list(DEFAULT_ALLOWED_NAMESPACES)),
                };
                Some(ImageRewriteConfig {
                    registry_url,
                    target_namespace: env("TARGET_REGISTRY_NAMESPACE")
                        .or(file.target_registry_namespace)
                        .unwrap_or_else(|| DEFAULT_TARGET_REGISTRY_NAMESPACE.to_string()),
                    allowed_namespaces,
                })
            }
            None => None,
        };

        let mig_resource = env("MIG_RESOURCE")
            .or(file.mig_resource)
            .or(file.classic_du.and_then(|x| x.resource));
        let mig = match mig_resource {
            Some(resource) => Some(MigConfig {
                profile: resource.trim().parse()?,
                pipeline_label: env("PIPELINE_LABEL")
                    .or(file.pipeline_label)
                    .as_deref()
                    .unwrap_or(DEFAULT_PIPELINE_LABEL)
                    .parse()?,
                gpu_resource: env("GPU_RESOURCE")
                    .or(file.gpu_resource)
                    .unwrap_or_else(|| DEFAULT_GPU_RESOURCE.to_string()),
            }),
            None => None,
        };

        Ok(Config {
            bind,
            namespace: env("DEPLOYMENT_NAMESPACE").or(file.deployment_namespace),
            service_name: env("WEBHOOK_SERVICE")
                .or(file.webhook_service)
                .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
            service_port,
            secret_name: env("WEBHOOK_SECRET_NAME")
                .or(file.webhook_secret_name)
                .unwrap_or_else(|| DEFAULT_SECRET_NAME.to_string()),
            webhook_config_name: env("WEBHOOK_CONFIG_NAME").or(file.webhook_config_name),
            image_rewrite,
            mig,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}
