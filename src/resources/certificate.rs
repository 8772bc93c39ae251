//! Certificate authority for the pgBackRest TLS channel
//!
//! Every cluster gets its own self-signed root plus two leaves: a client
//! certificate used by the database pods and a server certificate used by
//! the repository host. The whole set is generated at once and stored in
//! the `<cluster>-pgbackrest-cert` secret.
//!
//! Keys are ECDSA P-384 and all signatures are ECDSA with SHA-384.

use std::collections::BTreeMap;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384,
    SanType, SerialNumber,
};
use sec1::der::Encode;
use sec1::der::asn1::ObjectIdentifier;
use sec1::{EcParameters, EcPrivateKey};
use thiserror::Error;
use x509_parser::prelude::*;

/// Common name of every cluster root
pub const ROOT_COMMON_NAME: &str = "postgres-operator-ca";

/// Root validity (10 years)
pub const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Leaf validity (1 year)
pub const LEAF_VALIDITY_DAYS: i64 = 365;

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const EC_PRIVATE_KEY_LABEL: &str = "EC PRIVATE KEY";

/// Named curve recorded in every SEC1 key
pub const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("verification failed: {0}")]
    Verification(String),
}

pub type CertificateResult<T> = std::result::Result<T, CertificateError>;

/// A DER-encoded X.509 certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new(CERTIFICATE_LABEL, self.der.clone()))
    }

    pub fn from_pem(pem_data: &str) -> CertificateResult<Self> {
        Ok(Self {
            der: parse_labelled_pem(pem_data, CERTIFICATE_LABEL)?,
        })
    }
}

/// A SEC1 (`EC PRIVATE KEY`) encoded P-384 private key
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    der: Vec<u8>,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PrivateKey {
    fn from_key_pair(key: &KeyPair) -> CertificateResult<Self> {
        Ok(Self {
            der: pkcs8_to_sec1(&key.serialize_der())?,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new(EC_PRIVATE_KEY_LABEL, self.der.clone()))
    }

    pub fn from_pem(pem_data: &str) -> CertificateResult<Self> {
        let der = parse_labelled_pem(pem_data, EC_PRIVATE_KEY_LABEL)?;
        EcPrivateKey::try_from(der.as_slice())
            .map_err(|e| CertificateError::Parse(format!("EC private key: {e}")))?;
        Ok(Self { der })
    }
}

/// A certificate and its private key
#[derive(Clone, Debug)]
pub struct LeafCertificate {
    pub certificate: Certificate,
    pub key: PrivateKey,
}

/// Self-signed root able to issue leaves
pub struct RootCertificateAuthority {
    certificate: Certificate,
    key: PrivateKey,
    // rcgen reloads signing keys from PKCS#8
    signing_key_pem: String,
    certificate_pem: String,
}

impl RootCertificateAuthority {
    pub fn new() -> CertificateResult<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(ROOT_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());
        (params.not_before, params.not_after) = validity(ROOT_VALIDITY_DAYS);

        let key = generate_key()?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CertificateError::Signing(format!("root certificate: {e}")))?;

        Ok(Self {
            certificate: Certificate {
                der: cert.der().to_vec(),
            },
            key: PrivateKey::from_key_pair(&key)?,
            signing_key_pem: key.serialize_pem(),
            certificate_pem: cert.pem(),
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    /// Issue a leaf usable for both client and server authentication.
    ///
    /// Server leaves carry `dns_names` as subject alternative names; client
    /// leaves are identified by their common name only.
    pub fn issue_leaf(
        &self,
        common_name: &str,
        dns_names: &[String],
        is_server: bool,
    ) -> CertificateResult<LeafCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.serial_number = Some(random_serial());
        (params.not_before, params.not_after) = validity(LEAF_VALIDITY_DAYS);

        if is_server {
            params.subject_alt_names = dns_names
                .iter()
                .map(|name| {
                    Ia5String::try_from(name.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| CertificateError::Signing(format!("invalid DNS name {name}: {e}")))
                })
                .collect::<CertificateResult<Vec<_>>>()?;
        }

        let leaf_key = generate_key()?;
        let root_key = KeyPair::from_pem_and_sign_algo(&self.signing_key_pem, &PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CertificateError::Parse(format!("root key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.certificate_pem, &root_key)
            .map_err(|e| CertificateError::Parse(format!("root certificate: {e}")))?;
        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| CertificateError::Signing(format!("leaf {common_name}: {e}")))?;

        Ok(LeafCertificate {
            certificate: Certificate {
                der: cert.der().to_vec(),
            },
            key: PrivateKey::from_key_pair(&leaf_key)?,
        })
    }
}

/// Check that `leaf` carries a valid signature from `root`
pub fn verify_leaf(leaf: &Certificate, root: &Certificate) -> CertificateResult<()> {
    let (_, leaf_cert) = X509Certificate::from_der(leaf.der())
        .map_err(|e| CertificateError::Parse(format!("leaf: {e}")))?;
    let (_, root_cert) = X509Certificate::from_der(root.der())
        .map_err(|e| CertificateError::Parse(format!("root: {e}")))?;

    if leaf_cert.issuer().as_raw() != root_cert.subject().as_raw() {
        return Err(CertificateError::Verification(
            "issuer does not match root subject".to_string(),
        ));
    }
    leaf_cert
        .verify_signature(Some(root_cert.public_key()))
        .map_err(|e| CertificateError::Verification(e.to_string()))
}

/// Secret data for the pgBackRest TLS channel of a cluster
pub fn pgbackrest_certificate_data(
    cluster_name: &str,
    namespace: &str,
    cluster_domain: &str,
) -> CertificateResult<BTreeMap<String, String>> {
    let root = RootCertificateAuthority::new()?;
    let dns_names = vec![
        cluster_name.to_string(),
        format!("*.{cluster_name}.{namespace}.svc.{cluster_domain}"),
        format!(
            "*.{}.{namespace}.svc.{cluster_domain}",
            super::common::headless_service_name(cluster_name)
        ),
    ];
    let client = root.issue_leaf(cluster_name, &dns_names, false)?;
    let server = root.issue_leaf(cluster_name, &dns_names, true)?;

    let cipher_key: [u8; 16] = rand::random();
    let cipher_key = cipher_key.iter().map(|b| format!("{b:02x}")).collect::<String>();

    Ok(BTreeMap::from([
        ("key".to_string(), cipher_key),
        ("pgbackrest.ca-roots".to_string(), root.certificate().to_pem()),
        ("pgbackrest-client.crt".to_string(), client.certificate.to_pem()),
        ("pgbackrest-client.key".to_string(), client.key.to_pem()),
        ("pgbackrest-repo-host.crt".to_string(), server.certificate.to_pem()),
        ("pgbackrest-repo-host.key".to_string(), server.key.to_pem()),
    ]))
}

fn generate_key() -> CertificateResult<KeyPair> {
    KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

/// Backdated by an hour to tolerate clock skew between nodes
fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (
        now - ::time::Duration::hours(1),
        now + ::time::Duration::days(days),
    )
}

fn parse_labelled_pem(pem_data: &str, label: &str) -> CertificateResult<Vec<u8>> {
    let parsed = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| CertificateError::Parse(format!("PEM: {e}")))?;
    if parsed.tag() != label {
        return Err(CertificateError::Parse(format!(
            "expected {label}, found {}",
            parsed.tag()
        )));
    }
    Ok(parsed.into_contents())
}

/// Unwrap the ECPrivateKey from a PKCS#8 document and name the curve
fn pkcs8_to_sec1(pkcs8: &[u8]) -> CertificateResult<Vec<u8>> {
    let info = pkcs8::PrivateKeyInfo::try_from(pkcs8)
        .map_err(|e| CertificateError::Parse(format!("PKCS#8 key: {e}")))?;
    let key = EcPrivateKey::try_from(info.private_key)
        .map_err(|e| CertificateError::Parse(format!("EC private key: {e}")))?;
    EcPrivateKey {
        parameters: Some(EcParameters::NamedCurve(SECP384R1)),
        ..key
    }
    .to_der()
    .map_err(|e| CertificateError::Parse(format!("SEC1 encoding: {e}")))
}
