// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handlers for the sub-commands. Each one takes the engine, the password
//! reader and the output sink as arguments and reports failure through its
//! return value, leaving presentation and the exit status to the caller.

use anyhow::{Context, Result};
use clap::Args;
use log::{debug, info, warn};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::{
    ca::{CaConfig, CaEngine, CaError, CertAuthority, CertInfo},
    config::{
        self, CaDescriptor, InitSource, DEFAULT_INTERMEDIATE_YEARS,
        DEFAULT_ISSUER_YEARS,
    },
    secret_reader::{self, Confirm, PasswordReader, PasswordSource},
};

/// The command line was incomplete. The caller shows the command's usage.
#[derive(Error, Debug, PartialEq)]
pub enum UsageError {
    #[error("'init' needs one of --from-json or --yaml-config")]
    NoInitSource,

    #[error("Insufficient arguments to '{0}'")]
    MissingCommonName(&'static str),
}

impl UsageError {
    /// Name of the sub-command whose usage should be shown.
    pub fn command(&self) -> &'static str {
        match self {
            UsageError::NoInitSource => "init",
            UsageError::MissingCommonName(cmd) => cmd,
        }
    }
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct InitArgs {
    /// Path to YAML CA config file
    #[clap(long, short = 'c', value_name = "PATH")]
    pub yaml_config: Option<PathBuf>,

    /// Use password from environment var E
    #[clap(long, short = 'E', value_name = "E")]
    pub env_password: Option<String>,

    /// Initialize from an exported JSON dump
    #[clap(long, short = 'j', value_name = "PATH")]
    pub from_json: Option<PathBuf>,
}

/// Input read for `init`, ready to hand to the engine.
enum InitInput {
    Json(String),
    Descriptor(CaDescriptor),
}

/// Initialize the CA database `db` from a JSON export or a YAML descriptor
/// and print the root certificate.
pub fn init<E: CaEngine>(
    engine: &E,
    db: &Path,
    args: &InitArgs,
    reader: &mut dyn PasswordReader,
    out: &mut dyn Write,
) -> Result<()> {
    let source = InitSource::choose(
        args.from_json.as_deref(),
        args.yaml_config.as_deref(),
    )
    .ok_or(UsageError::NoInitSource)?;
    debug!("initializing {} from {:?}", db.display(), source);

    let input = match source {
        InitSource::ImportJson(path) => InitInput::Json(
            fs::read_to_string(&path).with_context(|| {
                format!("can't read json: {}", path.display())
            })?,
        ),
        InitSource::Descriptor(path) => {
            InitInput::Descriptor(CaDescriptor::from_file(&path)?)
        }
    };

    // only prompt once the input is known to be good
    let password = secret_reader::get_password(
        &PasswordSource::new(args.env_password.as_deref()),
        reader,
        Confirm::NewDatabase,
    )?;

    let ca = match input {
        InitInput::Json(json) => {
            let config = CaConfig::with_password(password);
            engine.import_json(db, &config, &json)?
        }
        InitInput::Descriptor(desc) => {
            let config = CaConfig {
                password,
                validity: Some(desc.validity()),
                subject: Some(desc.subject()),
            };
            engine.create(db, &config, true)?
        }
    };

    let cert = ca.certificate().clone();
    ca.close()?;
    info!("initialized CA database: {}", db.display());

    writeln!(out, "New CA cert:\n{}", cert)?;
    Ok(())
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct IssuerArgs {
    /// Issue issuer certificate with N years validity
    #[clap(long, short = 'V', value_name = "N", default_value_t = DEFAULT_ISSUER_YEARS)]
    pub validity: u32,

    /// Use S as the signing CA [root-CA]
    #[clap(long, short = 's', value_name = "S")]
    pub sign_with: Option<String>,

    /// Use password from environment var E
    #[clap(long, short = 'E', value_name = "E")]
    pub env_password: Option<String>,

    /// CommonName for the new certificate
    #[clap(value_name = "CN")]
    pub cn: Option<String>,
}

/// Issue a certificate for `args.cn`, signed by the root CA or the
/// intermediate named by `--sign-with`, and print it.
pub fn issuer<E: CaEngine>(
    engine: &E,
    db: &Path,
    args: &IssuerArgs,
    reader: &mut dyn PasswordReader,
    out: &mut dyn Write,
) -> Result<()> {
    let cn = args
        .cn
        .as_deref()
        .ok_or(UsageError::MissingCommonName("issuer"))?;

    let mut ca = open_signer(
        engine,
        db,
        args.env_password.as_deref(),
        args.sign_with.as_deref(),
        reader,
    )?;

    let info = CertInfo {
        subject: ca.subject().with_common_name(cn),
        validity: config::years(args.validity),
    };

    // We don't encrypt issuer certs
    let result = ca.new_server_cert(&info, None);
    let cert = finish(ca, result).context("can't create issuer cert")?;

    writeln!(out, "New issuer cert:\n{}", cert)?;
    Ok(())
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct IntermediateArgs {
    /// Issue intermediate CA certificate with N years validity
    #[clap(long, short = 'V', value_name = "N", default_value_t = DEFAULT_INTERMEDIATE_YEARS)]
    pub validity: u32,

    /// Use S as the signing CA [root-CA]
    #[clap(long, short = 's', value_name = "S")]
    pub sign_with: Option<String>,

    /// Use password from environment var E
    #[clap(long, short = 'E', value_name = "E")]
    pub env_password: Option<String>,

    /// CommonName for the new CA, also the name used with --sign-with
    #[clap(value_name = "CN")]
    pub cn: Option<String>,
}

/// Create a named intermediate CA and print its certificate.
pub fn intermediate<E: CaEngine>(
    engine: &E,
    db: &Path,
    args: &IntermediateArgs,
    reader: &mut dyn PasswordReader,
    out: &mut dyn Write,
) -> Result<()> {
    let cn = args
        .cn
        .as_deref()
        .ok_or(UsageError::MissingCommonName("intermediate"))?;

    let mut ca = open_signer(
        engine,
        db,
        args.env_password.as_deref(),
        args.sign_with.as_deref(),
        reader,
    )?;

    let info = CertInfo {
        subject: ca.subject().with_common_name(cn),
        validity: config::years(args.validity),
    };

    let result = ca.new_intermediate_ca(&info);
    let cert = finish(ca, result).context("can't create intermediate CA")?;

    writeln!(out, "New intermediate CA cert:\n{}", cert)?;
    Ok(())
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct ExportArgs {
    /// Use password from environment var E
    #[clap(long, short = 'E', value_name = "E")]
    pub env_password: Option<String>,

    /// Write the export to PATH instead of stdout
    #[clap(long, short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Dump the CA database as JSON suitable for `init --from-json`. Private
/// keys are written in the clear.
pub fn export<E: CaEngine>(
    engine: &E,
    db: &Path,
    args: &ExportArgs,
    reader: &mut dyn PasswordReader,
    out: &mut dyn Write,
) -> Result<()> {
    let ca = open_signer(engine, db, args.env_password.as_deref(), None, reader)?;
    let result = ca.export_json();
    let json = finish(ca, result).context("can't export CA")?;

    match &args.output {
        Some(path) => {
            fs::write(path, json.as_bytes()).with_context(|| {
                format!("can't write export: {}", path.display())
            })?;
            info!("exported {} to {}", db.display(), path.display());
        }
        None => writeln!(out, "{}", json)?,
    }
    Ok(())
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct ListArgs {
    /// Use password from environment var E
    #[clap(long, short = 'E', value_name = "E")]
    pub env_password: Option<String>,
}

/// Print one line for each certificate in the database.
pub fn list<E: CaEngine>(
    engine: &E,
    db: &Path,
    args: &ListArgs,
    reader: &mut dyn PasswordReader,
    out: &mut dyn Write,
) -> Result<()> {
    let ca = open_signer(engine, db, args.env_password.as_deref(), None, reader)?;
    let result = ca.certificates();

    for issued in finish(ca, result)? {
        writeln!(
            out,
            "{:<12} {} issuer=\"{}\"",
            issued.kind,
            issued.cert.summary(),
            issued.issuer
        )?;
    }
    Ok(())
}

/// Open an existing CA, pointed at the intermediate `sign_with` if given.
fn open_signer<E: CaEngine>(
    engine: &E,
    db: &Path,
    env_password: Option<&str>,
    sign_with: Option<&str>,
    reader: &mut dyn PasswordReader,
) -> Result<E::Ca> {
    // we only ask _once_
    let password = secret_reader::get_password(
        &PasswordSource::new(env_password),
        reader,
        Confirm::ExistingDatabase,
    )?;
    let ca = engine.open(db, &password)?;

    match sign_with.filter(|s| !s.is_empty()) {
        Some(name) => ca
            .find_ca(name)
            .with_context(|| format!("can't find signer {}", name)),
        None => Ok(ca),
    }
}

/// Close `ca` after an operation on it. A failure to close is reported
/// only when the operation itself succeeded.
fn finish<C: CertAuthority, T>(
    ca: C,
    result: Result<T, CaError>,
) -> Result<T, CaError> {
    let closed = ca.close();
    match result {
        Ok(value) => closed.map(|_| value),
        Err(e) => {
            if let Err(close) = closed {
                warn!("failed to close CA database: {}", close);
            }
            Err(e)
        }
    }
}
