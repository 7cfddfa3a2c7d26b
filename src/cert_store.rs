use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::PostParams, core::ObjectMeta, Api};
use log::{info, warn};

use crate::{
    certs::{CertificateAuthority, CertificateMaterial},
    Error,
};

const ROOT_CERT_KEY: &str = "ca.crt";
const LEAF_CERT_KEY: &str = "tls.crt";
const LEAF_KEY_KEY: &str = "tls.key";
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Minimal get / create-if-absent access to named credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_record(&self, name: &str) -> Result<Option<Secret>, kube::Error>;

    /// Must fail with a 409 `AlreadyExists` API error if the record exists.
    async fn create_record(&self, record: &Secret) -> Result<Secret, kube::Error>;
}

#[async_trait]
impl CredentialStore for Api<Secret> {
    async fn get_record(&self, name: &str) -> Result<Option<Secret>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create_record(&self, record: &Secret) -> Result<Secret, kube::Error> {
        self.create(&PostParams::default(), record).await
    }
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 || resp.reason == "AlreadyExists")
}

fn field(value: &mut Secret, key: &str) -> Result<String, Error> {
    let raw = value
        .data
        .as_mut()
        .and_then(|x| x.remove(key))
        .ok_or_else(|| Error::CorruptRecord(format!("missing {key} from secret")))?
        .0;
    String::from_utf8(raw)
        .map_err(|_| Error::CorruptRecord(format!("invalid UTF-8 in {key} of secret")))
}

impl TryFrom<Secret> for CertificateMaterial {
    type Error = Error;

    fn try_from(mut value: Secret) -> Result<Self, Self::Error> {
        let material = CertificateMaterial {
            root_cert_pem: field(&mut value, ROOT_CERT_KEY)?,
            leaf_cert_pem: field(&mut value, LEAF_CERT_KEY)?,
            leaf_key_pem: field(&mut value, LEAF_KEY_KEY)?,
        };
        material.verify()?;
        Ok(material)
    }
}

impl CertificateMaterial {
    pub fn into_secret(self, name: &str, namespace: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            ROOT_CERT_KEY.to_string(),
            ByteString(self.root_cert_pem.into_bytes()),
        );
        data.insert(
            LEAF_CERT_KEY.to_string(),
            ByteString(self.leaf_cert_pem.into_bytes()),
        );
        data.insert(
            LEAF_KEY_KEY.to_string(),
            ByteString(self.leaf_key_pem.into_bytes()),
        );
        Secret {
            data: Some(data),
            immutable: Some(true),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "workload-mutator".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            ..Default::default()
        }
    }
}

/// Loads the webhook TLS material from a named record, issuing it on first use.
pub struct SecretBackedCertStore<S> {
    store: S,
    name: String,
    namespace: String,
    authority: CertificateAuthority,
}

impl<S: CredentialStore> SecretBackedCertStore<S> {
    pub fn new(
        store: S,
        name: impl Into<String>,
        namespace: impl Into<String>,
        authority: CertificateAuthority,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            namespace: namespace.into(),
            authority,
        }
    }

    pub async fn load_or_create(&self) -> Result<CertificateMaterial, Error> {
        let name = &self.name;
        if let Some(secret) = self
            .store
            .get_record(name)
            .await
            .map_err(Error::StoreUnavailable)?
        {
            info!("loaded webhook certificate from secret {}/{name}", self.namespace);
            return self.loaded(secret);
        }

        info!(
            "secret {}/{name} not found, issuing webhook certificate",
            self.namespace
        );
        let material = self.authority.bootstrap()?;
        let record = material.clone().into_secret(name, &self.namespace);

        match self.store.create_record(&record).await {
            Ok(_) => {
                info!("created secret {}/{name}", self.namespace);
                Ok(material)
            }
            Err(e) if is_already_exists(&e) => {
                warn!(
                    "secret {}/{name} was created concurrently, using the existing one",
                    self.namespace
                );
                match self
                    .store
                    .get_record(name)
                    .await
                    .map_err(Error::StoreUnavailable)?
                {
                    Some(secret) => self.loaded(secret),
                    None => Err(Error::StoreUnavailable(e)),
                }
            }
            Err(e) => Err(Error::StoreUnavailable(e)),
        }
    }

    fn loaded(&self, secret: Secret) -> Result<CertificateMaterial, Error> {
        let material = CertificateMaterial::try_from(secret)?;
        let days = material.leaf_days_remaining(Utc::now())?;
        if days < 0 {
            warn!(
                "webhook certificate in secret {}/{} expired {} days ago, delete the secret and restart to re-issue",
                self.namespace, self.name, -days
            );
        } else if days <= EXPIRY_WARNING_DAYS {
            warn!(
                "webhook certificate in secret {}/{} expires in {days} days",
                self.namespace, self.name
            );
        }
        Ok(material)
    }
}
