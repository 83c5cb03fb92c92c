// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use pem_rfc7468::LineEnding;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use x509_parser::{
    certificate::X509Certificate,
    objects::{oid2sn, oid_registry},
    parse_x509_certificate,
    pem::parse_x509_pem,
};

const PEM_LABEL: &str = "CERTIFICATE";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("failed to decode PEM certificate: {0}")]
    BadPem(String),

    #[error("expected PEM label \"CERTIFICATE\", got \"{0}\"")]
    BadLabel(String),

    #[error("failed to parse X.509 certificate: {0}")]
    BadDer(String),

    #[error("failed to encode certificate as PEM: {e}")]
    Encode { e: pem_rfc7468::Error },
}

/// An X.509 certificate known to parse. Holds both the DER and the PEM
/// encoding, `Display` renders it for humans.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    der: Vec<u8>,
    pem: String,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Result<Self, CertError> {
        parse_x509_certificate(&der)
            .map_err(|e| CertError::BadDer(e.to_string()))?;
        let pem = pem_rfc7468::encode_string(PEM_LABEL, LineEnding::LF, &der)
            .map_err(|e| CertError::Encode { e })?;

        Ok(Self { der, pem })
    }

    pub fn from_pem(pem: &str) -> Result<Self, CertError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CertError::BadPem(e.to_string()))?;
        if pem.label != PEM_LABEL {
            return Err(CertError::BadLabel(pem.label));
        }

        Self::from_der(pem.contents)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    fn parse(&self) -> Option<X509Certificate<'_>> {
        parse_x509_certificate(&self.der).ok().map(|(_, cert)| cert)
    }

    /// Single line description: serial, expiry and subject.
    pub fn summary(&self) -> String {
        match self.parse() {
            Some(cert) => format!(
                "serial={} expires={} subject=\"{}\"",
                cert.raw_serial_as_string(),
                cert.validity().not_after,
                cert.subject()
            ),
            None => "<unparseable certificate>".to_string(),
        }
    }
}

impl Display for Certificate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let cert = match self.parse() {
            Some(c) => c,
            None => return writeln!(f, "<unparseable certificate>"),
        };

        let alg = &cert.public_key().algorithm.algorithm;
        let alg = oid2sn(alg, oid_registry())
            .map(str::to_string)
            .unwrap_or_else(|_| alg.to_id_string());

        writeln!(f, "Certificate:")?;
        writeln!(f, "    Subject:    {}", cert.subject())?;
        writeln!(f, "    Issuer:     {}", cert.issuer())?;
        writeln!(f, "    Serial:     {}", cert.raw_serial_as_string())?;
        writeln!(f, "    Not Before: {}", cert.validity().not_before)?;
        writeln!(f, "    Not After:  {}", cert.validity().not_after)?;
        writeln!(f, "    CA:         {}", cert.is_ca())?;
        writeln!(f, "    Public Key: {}", alg)?;
        write!(f, "{}", self.pem)
    }
}
