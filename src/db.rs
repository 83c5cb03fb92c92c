// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fs4::FileExt;
use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::{
    ca::{
        CaConfig, CaEngine, CaError, CertAuthority, CertInfo, CertKind, Issued,
    },
    cert::Certificate,
    config::Subject,
    seal::{self, SealError, Sealed, SealingKey},
};

const DB_VERSION: u32 = 1;
const LOCK_EXT: &str = ".lock";
const SERIAL_LEN: usize = 16;

/// How a private key in the database is sealed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
enum KeyProtection {
    /// under the key derived from the database password
    Database,
    /// under a key derived from a password of its own
    Password {
        #[serde(with = "hex")]
        salt: Vec<u8>,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct SealedKey {
    protection: KeyProtection,
    #[serde(flatten)]
    sealed: Sealed,
}

impl SealedKey {
    fn database(key: &SealingKey, pem: &str) -> Result<Self, CaError> {
        Ok(Self {
            protection: KeyProtection::Database,
            sealed: key.seal(pem.as_bytes())?,
        })
    }

    fn password(password: &str, pem: &str) -> Result<Self, CaError> {
        let salt = seal::new_salt();
        let key = SealingKey::derive(password, &salt)?;
        Ok(Self {
            protection: KeyProtection::Password { salt },
            sealed: key.seal(pem.as_bytes())?,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Entry {
    subject: Subject,
    /// common name of the signing CA
    issuer: String,
    serial: String,
    cert: String,
    key: SealedKey,
}

/// The database file.
#[derive(Debug, Deserialize, Serialize)]
struct DbState {
    version: u32,
    #[serde(with = "hex")]
    salt: Vec<u8>,
    root: Entry,
    #[serde(default)]
    intermediates: Vec<Entry>,
    #[serde(default)]
    certs: Vec<Entry>,
}

/// The `export` format: the database with private keys in clear.
#[derive(Debug, Deserialize, Serialize)]
struct Export {
    root: ExportEntry,
    #[serde(default)]
    intermediates: Vec<ExportEntry>,
    #[serde(default)]
    certs: Vec<ExportEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ExportEntry {
    subject: Subject,
    issuer: String,
    serial: String,
    cert: String,
    key: String,
}

/// Exclusive hold on a database: an advisory lock on `<db>.lock`. The
/// lock file itself is left in place, the OS drops the lock when the file
/// is closed, including when the process dies.
struct Lock {
    file: File,
    path: PathBuf,
}

impl Lock {
    fn path(db: &Path) -> PathBuf {
        let mut path = db.as_os_str().to_owned();
        path.push(LOCK_EXT);
        PathBuf::from(path)
    }

    fn acquire(db: &Path) -> Result<Self, CaError> {
        let path = Self::path(db);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired lock: {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs4::lock_contended_error().kind() => {
                Err(CaError::Locked(db.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(self) -> io::Result<()> {
        debug!("releasing lock: {}", self.path.display());
        FileExt::unlock(&self.file)
    }
}

/// CA databases stored as a single JSON file with sealed private keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileEngine;

impl CaEngine for FileEngine {
    type Ca = FileCa;

    fn open(&self, db: &Path, password: &str) -> Result<FileCa, CaError> {
        if !db.exists() {
            return Err(CaError::NotFound(db.to_path_buf()));
        }
        let lock = Lock::acquire(db)?;

        FileCa::load(db, password, lock)
    }

    fn create(
        &self,
        db: &Path,
        config: &CaConfig,
        allow_create: bool,
    ) -> Result<FileCa, CaError> {
        if db.exists() {
            info!("opening existing CA database: {}", db.display());
            return self.open(db, &config.password);
        }
        if !allow_create {
            return Err(CaError::NotFound(db.to_path_buf()));
        }

        let subject = config.subject.as_ref().ok_or(CaError::NoSubject)?;
        let validity = config.validity.ok_or(CaError::BadValidity)?;

        let lock = Lock::acquire(db)?;
        if db.exists() {
            return Err(CaError::Exists(db.to_path_buf()));
        }

        let salt = seal::new_salt();
        let key = SealingKey::derive(&config.password, &salt)?;

        debug!("generating root CA key & cert for: {:?}", subject);
        let (key_pair, key_pem) = new_key_pair()?;
        let serial = new_serial();
        let params = cert_params(subject, validity, CertKind::Root, &serial)?;
        let cert = params.self_signed(&key_pair)?;
        let cert = Certificate::from_der(cert.der().to_vec())?;

        let root = Entry {
            subject: subject.clone(),
            issuer: subject.common_name.clone(),
            serial: hex::encode(serial),
            cert: cert.pem().to_string(),
            key: SealedKey::database(&key, &key_pem)?,
        };

        let ca = FileCa {
            path: db.to_path_buf(),
            state: DbState {
                version: DB_VERSION,
                salt,
                root,
                intermediates: Vec::new(),
                certs: Vec::new(),
            },
            key,
            signer: None,
            cert,
            lock,
        };
        ca.save()?;
        info!("created CA database: {}", db.display());

        Ok(ca)
    }

    fn import_json(
        &self,
        db: &Path,
        config: &CaConfig,
        json: &str,
    ) -> Result<FileCa, CaError> {
        let export: Export =
            serde_json::from_str(json).map_err(|e| CaError::BadJson { e })?;

        let lock = Lock::acquire(db)?;
        if db.exists() {
            return Err(CaError::Exists(db.to_path_buf()));
        }

        let salt = seal::new_salt();
        let key = SealingKey::derive(&config.password, &salt)?;

        let root = import_entry(&key, export.root)?;
        let intermediates = export
            .intermediates
            .into_iter()
            .map(|e| import_entry(&key, e))
            .collect::<Result<Vec<_>, _>>()?;
        let certs = export
            .certs
            .into_iter()
            .map(|e| import_entry(&key, e))
            .collect::<Result<Vec<_>, _>>()?;
        let cert = Certificate::from_pem(&root.cert)?;

        let ca = FileCa {
            path: db.to_path_buf(),
            state: DbState {
                version: DB_VERSION,
                salt,
                root,
                intermediates,
                certs,
            },
            key,
            signer: None,
            cert,
            lock,
        };
        ca.save()?;
        info!(
            "imported CA database: {} ({} intermediate CAs, {} certs)",
            db.display(),
            ca.state.intermediates.len(),
            ca.state.certs.len()
        );

        Ok(ca)
    }
}

fn import_entry(key: &SealingKey, entry: ExportEntry) -> Result<Entry, CaError> {
    debug!("importing: {}", entry.subject.common_name);
    let cert = Certificate::from_pem(&entry.cert)?;
    KeyPair::from_pem(&entry.key).map_err(|e| {
        CaError::BadKey(format!("{}: {}", entry.subject.common_name, e))
    })?;

    Ok(Entry {
        key: SealedKey::database(key, &entry.key)?,
        cert: cert.pem().to_string(),
        subject: entry.subject,
        issuer: entry.issuer,
        serial: entry.serial,
    })
}

/// An open CA database. Signs with the root CA or, after `find_ca`, one of
/// its intermediates.
pub struct FileCa {
    path: PathBuf,
    state: DbState,
    key: SealingKey,
    /// index into `state.intermediates`, `None` for the root
    signer: Option<usize>,
    /// certificate of the signer
    cert: Certificate,
    lock: Lock,
}

impl FileCa {
    fn load(path: &Path, password: &str, lock: Lock) -> Result<Self, CaError> {
        debug!("loading CA database: {}", path.display());
        let data = fs::read(path)?;
        let state: DbState =
            serde_json::from_slice(&data).map_err(|e| CaError::BadJson { e })?;
        if state.version != DB_VERSION {
            return Err(CaError::Version(state.version));
        }

        let key = SealingKey::derive(password, &state.salt)?;
        // the root key only opens with the right password
        key.open(&state.root.key.sealed).map_err(|e| match e {
            SealError::Open => CaError::BadPassword,
            e => e.into(),
        })?;
        let cert = Certificate::from_pem(&state.root.cert)?;

        Ok(Self {
            path: path.to_path_buf(),
            state,
            key,
            signer: None,
            cert,
            lock,
        })
    }

    fn save(&self) -> Result<(), CaError> {
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| CaError::BadJson { e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!("wrote CA database: {}", self.path.display());

        Ok(())
    }

    fn signer_entry(&self) -> &Entry {
        match self.signer {
            Some(i) => &self.state.intermediates[i],
            None => &self.state.root,
        }
    }

    fn entries(&self) -> impl Iterator<Item = (CertKind, &Entry)> {
        std::iter::once((CertKind::Root, &self.state.root))
            .chain(
                self.state
                    .intermediates
                    .iter()
                    .map(|e| (CertKind::Intermediate, e)),
            )
            .chain(self.state.certs.iter().map(|e| (CertKind::Server, e)))
    }

    /// PEM private key for `key`, `None` when it has a password of its own.
    fn open_key(
        &self,
        key: &SealedKey,
    ) -> Result<Option<Zeroizing<String>>, CaError> {
        if key.protection != KeyProtection::Database {
            return Ok(None);
        }

        let pem = self.key.open(&key.sealed)?;
        let pem = std::str::from_utf8(&pem)
            .map_err(|_| CaError::BadKey("key is not valid UTF-8".into()))?;
        Ok(Some(Zeroizing::new(pem.to_string())))
    }

    fn issue(
        &mut self,
        info: &CertInfo,
        kind: CertKind,
        key_password: Option<&str>,
    ) -> Result<Certificate, CaError> {
        let cn = &info.subject.common_name;
        if self.entries().any(|(_, e)| &e.subject.common_name == cn) {
            return Err(CaError::Duplicate(cn.clone()));
        }

        let signer = self.signer_entry();
        debug!(
            "signing {} cert \"{}\" with \"{}\"",
            kind, cn, signer.subject.common_name
        );
        let signer_pem = self.open_key(&signer.key)?.ok_or_else(|| {
            CaError::BadKey("CA key is not sealed by the database".into())
        })?;
        let signer_key = KeyPair::from_pem(&signer_pem)?;
        let issuer = CertificateParams::from_ca_cert_pem(&signer.cert)?
            .self_signed(&signer_key)?;
        let issuer_cn = signer.subject.common_name.clone();

        let (key_pair, key_pem) = new_key_pair()?;
        let serial = new_serial();
        let params = cert_params(&info.subject, info.validity, kind, &serial)?;
        let cert = params.signed_by(&key_pair, &issuer, &signer_key)?;
        let cert = Certificate::from_der(cert.der().to_vec())?;

        let key = match key_password {
            Some(password) => SealedKey::password(password, &key_pem)?,
            None => SealedKey::database(&self.key, &key_pem)?,
        };
        let entry = Entry {
            subject: info.subject.clone(),
            issuer: issuer_cn,
            serial: hex::encode(serial),
            cert: cert.pem().to_string(),
            key,
        };

        let list = match kind {
            CertKind::Intermediate => &mut self.state.intermediates,
            _ => &mut self.state.certs,
        };
        list.push(entry);
        if let Err(e) = self.save() {
            match kind {
                CertKind::Intermediate => self.state.intermediates.pop(),
                _ => self.state.certs.pop(),
            };
            return Err(e);
        }
        info!("issued {} certificate: {}", kind, cn);

        Ok(cert)
    }
}

impl CertAuthority for FileCa {
    fn subject(&self) -> &Subject {
        &self.signer_entry().subject
    }

    fn certificate(&self) -> &Certificate {
        &self.cert
    }

    fn find_ca(mut self, name: &str) -> Result<Self, CaError> {
        let index = self
            .state
            .intermediates
            .iter()
            .position(|e| e.subject.common_name == name)
            .ok_or_else(|| CaError::UnknownCa(name.to_string()))?;

        self.cert = Certificate::from_pem(&self.state.intermediates[index].cert)?;
        self.signer = Some(index);
        debug!("signing with intermediate CA: {}", name);

        Ok(self)
    }

    fn new_intermediate_ca(
        &mut self,
        info: &CertInfo,
    ) -> Result<Certificate, CaError> {
        self.issue(info, CertKind::Intermediate, None)
    }

    fn new_server_cert(
        &mut self,
        info: &CertInfo,
        key_password: Option<&str>,
    ) -> Result<Certificate, CaError> {
        self.issue(info, CertKind::Server, key_password)
    }

    fn certificates(&self) -> Result<Vec<Issued>, CaError> {
        self.entries()
            .map(|(kind, e)| {
                Ok(Issued {
                    kind,
                    issuer: e.issuer.clone(),
                    cert: Certificate::from_pem(&e.cert)?,
                })
            })
            .collect()
    }

    fn export_json(&self) -> Result<String, CaError> {
        let export_entry = |e: &Entry| -> Result<Option<ExportEntry>, CaError> {
            let key = match self.open_key(&e.key)? {
                Some(key) => key,
                None => {
                    warn!(
                        "not exporting \"{}\": its key has a password of its own",
                        e.subject.common_name
                    );
                    return Ok(None);
                }
            };

            Ok(Some(ExportEntry {
                subject: e.subject.clone(),
                issuer: e.issuer.clone(),
                serial: e.serial.clone(),
                cert: e.cert.clone(),
                key: key.to_string(),
            }))
        };

        let root = export_entry(&self.state.root)?.ok_or_else(|| {
            CaError::BadKey("root key is not sealed by the database".into())
        })?;
        let mut intermediates = Vec::new();
        for e in &self.state.intermediates {
            intermediates.extend(export_entry(e)?);
        }
        let mut certs = Vec::new();
        for e in &self.state.certs {
            certs.extend(export_entry(e)?);
        }

        let export = Export {
            root,
            intermediates,
            certs,
        };
        serde_json::to_string_pretty(&export).map_err(|e| CaError::BadJson { e })
    }

    fn close(self) -> Result<(), CaError> {
        debug!("closing CA database: {}", self.path.display());
        self.lock.release()?;
        Ok(())
    }
}

fn new_key_pair() -> Result<(KeyPair, Zeroizing<String>), CaError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let pem = Zeroizing::new(key_pair.serialize_pem());
    Ok((key_pair, pem))
}

/// Random positive serial number with no leading zero byte.
fn new_serial() -> [u8; SERIAL_LEN] {
    let mut serial = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x40;
    serial
}

fn distinguished_name(subject: &Subject) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    let fields = [
        (DnType::CountryName, &subject.country),
        (DnType::OrganizationName, &subject.organization),
        (DnType::OrganizationalUnitName, &subject.organizational_unit),
        (DnType::CommonName, &subject.common_name),
    ];
    for (ty, value) in fields {
        if !value.is_empty() {
            dn.push(ty, value.as_str());
        }
    }
    dn
}

fn cert_params(
    subject: &Subject,
    validity: Duration,
    kind: CertKind,
    serial: &[u8],
) -> Result<CertificateParams, CaError> {
    // certificates carry whole seconds
    let not_before = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .map_err(|_| CaError::BadValidity)?;
    let validity =
        time::Duration::try_from(validity).map_err(|_| CaError::BadValidity)?;
    let not_after = not_before
        .checked_add(validity)
        .ok_or(CaError::BadValidity)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(subject);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
    params.use_authority_key_identifier_extension = kind != CertKind::Root;

    match kind {
        CertKind::Root | CertKind::Intermediate => {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        }
        CertKind::Server => {
            params.is_ca = IsCa::ExplicitNoCa;
            // ECDSA keys sign, they can't encipher
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages =
                vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
    }

    Ok(params)
}
