use chrono::{DateTime, Datelike, Utc};
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use x509_certificate::CapturedX509Certificate;

use crate::Error;

const ORGANIZATION: &str = "workload-mutator";
const ROOT_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 1;

/// PEM encoded trust material for the webhook endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub root_cert_pem: String,
    pub leaf_cert_pem: String,
    pub leaf_key_pem: String,
}

impl CertificateMaterial {
    /// Checks that all three fields parse, that the leaf is signed by the root,
    /// and that the key belongs to the leaf.
    pub fn verify(&self) -> Result<(), Error> {
        let root = CapturedX509Certificate::from_pem(self.root_cert_pem.as_bytes())
            .map_err(|e| Error::CorruptRecord(format!("invalid root certificate: {e}")))?;
        let leaf = CapturedX509Certificate::from_pem(self.leaf_cert_pem.as_bytes())
            .map_err(|e| Error::CorruptRecord(format!("invalid leaf certificate: {e}")))?;
        let key = KeyPair::from_pem(&self.leaf_key_pem)
            .map_err(|e| Error::CorruptRecord(format!("invalid leaf key: {e}")))?;

        leaf.verify_signed_by_certificate(&root).map_err(|e| {
            Error::CorruptRecord(format!("leaf certificate is not signed by root: {e}"))
        })?;
        if leaf.public_key_data().as_ref() != key.public_key_raw() {
            return Err(Error::CorruptRecord(
                "leaf key does not match leaf certificate".to_string(),
            ));
        }
        Ok(())
    }

    /// Whole days until the leaf's `notAfter`, negative once it has passed.
    pub fn leaf_days_remaining(&self, now: DateTime<Utc>) -> Result<i64, Error> {
        let leaf = CapturedX509Certificate::from_pem(self.leaf_cert_pem.as_bytes())
            .map_err(|e| Error::CorruptRecord(format!("invalid leaf certificate: {e}")))?;
        Ok((leaf.validity_not_after() - now).num_days())
    }

    /// Hex SHA-256 over the DER of the root certificate.
    pub fn root_fingerprint(&self) -> Result<String, Error> {
        let root = CapturedX509Certificate::from_pem(self.root_cert_pem.as_bytes())
            .map_err(|e| Error::CorruptRecord(format!("invalid root certificate: {e}")))?;
        Ok(hex::encode(Sha256::digest(root.constructed_data())))
    }
}

/// Issues a self-signed root and a leaf for the in-cluster service names.
pub struct CertificateAuthority {
    service: String,
    namespace: String,
}

impl CertificateAuthority {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
        }
    }

    pub fn subject_alt_names(&self) -> Vec<String> {
        let service = &self.service;
        let ns = &self.namespace;
        vec![
            service.clone(),
            format!("{service}.{ns}"),
            format!("{service}.{ns}.svc"),
            format!("{service}.{ns}.svc.cluster.local"),
        ]
    }

    pub fn bootstrap(&self) -> Result<CertificateMaterial, Error> {
        let today = Utc::now().date_naive();
        let (month, day) = (today.month() as u8, today.day() as u8);
        // Feb 29 has no counterpart in most target years.
        let day = if month == 2 && day == 29 { 28 } else { day };
        let years_from_now = |years: i32| date_time_ymd(today.year() + years, month, day);
        let not_before = years_from_now(0);

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORGANIZATION);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} root", self.service));
        params.not_before = not_before;
        params.not_after = years_from_now(ROOT_VALIDITY_YEARS);

        let root_key = KeyPair::generate()?;
        let root = params.self_signed(&root_key)?;

        let mut params = CertificateParams::new(self.subject_alt_names())?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORGANIZATION);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{}.{}.svc", self.service, self.namespace));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = not_before;
        params.not_after = years_from_now(LEAF_VALIDITY_YEARS);

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &root, &root_key)?;

        Ok(CertificateMaterial {
            root_cert_pem: root.pem(),
            leaf_cert_pem: leaf.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        })
    }
}
