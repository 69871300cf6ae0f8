use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::parse_x509_certificate;

use crate::{utils::decode_pem_or_base64, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Some(Self::RsaSha1),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Some(Self::RsaSha256),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Some(Self::RsaSha384),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Some(Self::RsaSha512),
            _ => None,
        }
    }

    fn digest_and_scheme(self, message: &[u8]) -> (Vec<u8>, Pkcs1v15Sign) {
        match self {
            Self::RsaSha1 => (Sha1::digest(message).to_vec(), Pkcs1v15Sign::new::<Sha1>()),
            Self::RsaSha256 => (
                Sha256::digest(message).to_vec(),
                Pkcs1v15Sign::new::<Sha256>(),
            ),
            Self::RsaSha384 => (
                Sha384::digest(message).to_vec(),
                Pkcs1v15Sign::new::<Sha384>(),
            ),
            Self::RsaSha512 => (
                Sha512::digest(message).to_vec(),
                Pkcs1v15Sign::new::<Sha512>(),
            ),
        }
    }
}

/// An IdP signing certificate the SP has chosen to trust.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    subject: String,
    fingerprint: String,
    public_key: RsaPublicKey,
}

impl TrustedCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, ConfigError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| ConfigError::InvalidCertificate(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| ConfigError::InvalidCertificate(format!("not an RSA key: {e}")))?;

        Ok(Self {
            subject: cert.subject().to_string(),
            fingerprint: hex::encode(Sha256::digest(der)),
            public_key,
        })
    }

    /// Accepts PEM or the bare Base64 found in metadata `X509Certificate`
    /// elements.
    pub fn from_pem(pem: &str) -> Result<Self, ConfigError> {
        let der = decode_pem_or_base64(pem)
            .map_err(|e| ConfigError::InvalidCertificate(format!("bad base64: {e}")))?;
        Self::from_der(&der)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn verify(&self, algorithm: SignatureAlgorithm, message: &[u8], signature: &[u8]) -> bool {
        let (hashed, scheme) = algorithm.digest_and_scheme(message);
        self.public_key.verify(scheme, &hashed, signature).is_ok()
    }
}
