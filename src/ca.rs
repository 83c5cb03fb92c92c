// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operations the command handlers need from a certificate authority.
//! `db::FileEngine` is the implementation shipped with this crate.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{
    cert::{CertError, Certificate},
    config::Subject,
    seal::SealError,
};

#[derive(Error, Debug)]
pub enum CaError {
    #[error("CA database \"{}\" does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("CA database \"{}\" already exists", .0.display())]
    Exists(PathBuf),

    #[error("CA database \"{}\" is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("incorrect password for CA database")]
    BadPassword,

    #[error("no CA named \"{0}\"")]
    UnknownCa(String),

    #[error("a certificate named \"{0}\" already exists")]
    Duplicate(String),

    #[error("a subject is required to create a new CA")]
    NoSubject,

    #[error("malformed private key: {0}")]
    BadKey(String),

    #[error("validity period is out of range")]
    BadValidity,

    #[error("unsupported CA database version: {0}")]
    Version(u32),

    #[error("malformed CA database or export: {e}")]
    BadJson { e: serde_json::Error },

    #[error("certificate generation failed: {e}")]
    CertGen { e: rcgen::Error },

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::CertGen { e }
    }
}

/// Parameters for opening or creating a CA database.
pub struct CaConfig {
    pub password: Zeroizing<String>,
    /// Validity of a new root certificate.
    pub validity: Option<Duration>,
    /// Subject of a new root certificate.
    pub subject: Option<Subject>,
}

impl CaConfig {
    /// Configuration that's only good for opening an existing database.
    pub fn with_password(password: Zeroizing<String>) -> Self {
        Self {
            password,
            validity: None,
            subject: None,
        }
    }
}

/// What a new certificate should look like.
#[derive(Clone, Debug, PartialEq)]
pub struct CertInfo {
    pub subject: Subject,
    pub validity: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertKind {
    Root,
    Intermediate,
    Server,
}

impl fmt::Display for CertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            CertKind::Root => "root",
            CertKind::Intermediate => "intermediate",
            CertKind::Server => "server",
        };
        f.pad(str)
    }
}

/// A certificate held in a CA database and the name of the CA that
/// signed it.
#[derive(Clone, Debug)]
pub struct Issued {
    pub kind: CertKind,
    pub issuer: String,
    pub cert: Certificate,
}

/// Entry points for getting a handle on a CA database.
pub trait CaEngine {
    type Ca: CertAuthority;

    /// Open an existing database.
    fn open(&self, db: &Path, password: &str) -> Result<Self::Ca, CaError>;

    /// Open `db`, or create it with a new root CA described by `config`
    /// when it doesn't exist and `allow_create` is set.
    fn create(
        &self,
        db: &Path,
        config: &CaConfig,
        allow_create: bool,
    ) -> Result<Self::Ca, CaError>;

    /// Create `db` from the JSON produced by `CertAuthority::export_json`.
    fn import_json(
        &self,
        db: &Path,
        config: &CaConfig,
        json: &str,
    ) -> Result<Self::Ca, CaError>;
}

/// Handle on an open CA. Certificates are signed by the root CA unless the
/// handle has been pointed at an intermediate with `find_ca`. The handle
/// holds the database open until `close` is called or it's dropped.
pub trait CertAuthority: Sized {
    /// Subject of the signing CA.
    fn subject(&self) -> &Subject;

    /// Certificate of the signing CA.
    fn certificate(&self) -> &Certificate;

    /// Switch signing to the intermediate CA named `name`.
    fn find_ca(self, name: &str) -> Result<Self, CaError>;

    fn new_intermediate_ca(
        &mut self,
        info: &CertInfo,
    ) -> Result<Certificate, CaError>;

    /// Issue a non-CA certificate. The private key is protected by
    /// `key_password` when one is given, by the database password
    /// otherwise.
    fn new_server_cert(
        &mut self,
        info: &CertInfo,
        key_password: Option<&str>,
    ) -> Result<Certificate, CaError>;

    /// Every certificate in the database, root first.
    fn certificates(&self) -> Result<Vec<Issued>, CaError>;

    fn export_json(&self) -> Result<String, CaError>;

    /// Release the database.
    fn close(self) -> Result<(), CaError>;
}
