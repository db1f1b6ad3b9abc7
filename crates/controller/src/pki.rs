//! Certificate issuance and DH parameter generation, consumed as opaque
//! capabilities by the VPN services.

use futures_util::future::BoxFuture;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tokio::process::Command;
use tracing::debug;

use crate::persistence::CaRecord;

/// Stored on openvpn servers until real parameters are generated.
pub const DH_PLACEHOLDER: &str = "-----BEGIN DH PARAMETERS-----\n\
MIIBCAKCAQEA/////////////////////////////////////////////////////w==\n\
-----END DH PARAMETERS-----\n";

#[derive(Debug, Clone, Copy)]
pub struct CertRequest<'a> {
    pub common_name: &'a str,
    pub organization: Option<&'a str>,
    /// Signing CA; `None` issues a self-signed certificate.
    pub ca: Option<&'a CaRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    pub certificate: String,
    pub private_key: String,
}

pub trait CertIssuer: Send + Sync + 'static {
    fn issue(&self, request: &CertRequest<'_>) -> crate::Result<IssuedCert>;

    fn create_ca(&self, common_name: &str) -> crate::Result<IssuedCert>;
}

/// Local issuer backed by `rcgen`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenIssuer;

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    if let Some(organization) = organization {
        name.push(DnType::OrganizationName, organization);
    }
    name
}

impl CertIssuer for RcgenIssuer {
    fn issue(&self, request: &CertRequest<'_>) -> crate::Result<IssuedCert> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(request.common_name, request.organization);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let cert = match request.ca {
            Some(ca) => {
                let ca_key = KeyPair::from_pem(&ca.private_key)?;
                let issuer = Issuer::from_ca_cert_pem(&ca.certificate, ca_key)?;
                params.signed_by(&key, &issuer)?
            }
            None => params.self_signed(&key)?,
        };
        debug!(common_name = request.common_name, signed = request.ca.is_some(), "issued certificate");
        Ok(IssuedCert {
            certificate: cert.pem(),
            private_key: key.serialize_pem(),
        })
    }

    fn create_ca(&self, common_name: &str) -> crate::Result<IssuedCert> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        Ok(IssuedCert {
            certificate: cert.pem(),
            private_key: key.serialize_pem(),
        })
    }
}

pub trait DhGenerator: Send + Sync + 'static {
    fn generate(&self, bits: u32) -> BoxFuture<'_, crate::Result<String>>;
}

/// Runs `openssl dhparam`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslDhGenerator;

impl DhGenerator for OpensslDhGenerator {
    fn generate(&self, bits: u32) -> BoxFuture<'_, crate::Result<String>> {
        Box::pin(async move {
            let output = Command::new("openssl")
                .arg("dhparam")
                .arg(bits.to_string())
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                anyhow::bail!(
                    "openssl dhparam exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            let pem = String::from_utf8(output.stdout)?;
            if !pem.contains("BEGIN DH PARAMETERS") {
                anyhow::bail!("openssl dhparam produced no DH parameters");
            }
            Ok(pem)
        })
    }
}

/// Returns a fixed value; used where generation is unavailable.
#[derive(Debug, Clone)]
pub struct StaticDhGenerator(pub String);

impl DhGenerator for StaticDhGenerator {
    fn generate(&self, _bits: u32) -> BoxFuture<'_, crate::Result<String>> {
        let value = self.0.clone();
        Box::pin(async move { Ok(value) })
    }
}
