// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use env_logger::Builder;
use log::{warn, LevelFilter};
use std::{
    io::{self, Write},
    path::PathBuf,
    process,
};

use pki_tool::{
    commands::{
        self, ExportArgs, InitArgs, IntermediateArgs, IssuerArgs, ListArgs,
        UsageError,
    },
    db::FileEngine,
    secret_reader::StdioPasswordReader,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// Initialize a certificate authority and issue certificates from it
struct Args {
    /// Increase verbosity
    #[clap(long, env)]
    verbose: bool,

    /// Path to the CA database
    #[clap(value_name = "DB")]
    db: PathBuf,

    /// subcommands
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Initialize a CA database from a YAML config or a JSON export.
    Init(InitArgs),

    /// Issue a new issuer certificate with the given CommonName.
    Issuer(IssuerArgs),

    /// Create a named intermediate CA for use with --sign-with.
    Intermediate(IntermediateArgs),

    /// Export the CA database, private keys included, as JSON.
    Export(ExportArgs),

    /// List the certificates in the CA database.
    List(ListArgs),
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = Builder::from_default_env();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    builder.filter(None, level).init();

    let engine = FileEngine;
    let mut reader = StdioPasswordReader::default();
    let mut stdout = io::stdout().lock();

    let result = match &args.command {
        Command::Init(a) => {
            commands::init(&engine, &args.db, a, &mut reader, &mut stdout)
        }
        Command::Issuer(a) => {
            commands::issuer(&engine, &args.db, a, &mut reader, &mut stdout)
        }
        Command::Intermediate(a) => commands::intermediate(
            &engine,
            &args.db,
            a,
            &mut reader,
            &mut stdout,
        ),
        Command::Export(a) => {
            commands::export(&engine, &args.db, a, &mut reader, &mut stdout)
        }
        Command::List(a) => {
            commands::list(&engine, &args.db, a, &mut reader, &mut stdout)
        }
    };

    let status = report(result, &mut stdout)?;
    if status != 0 {
        stdout.flush()?;
        process::exit(status);
    }

    Ok(())
}

/// Turn the result of a command into an exit status. A usage error is
/// logged as a warning and the sub-command's help written to `out`, any
/// other error is passed back to the caller.
fn report(result: Result<()>, out: &mut dyn Write) -> Result<i32> {
    let e = match result {
        Ok(()) => return Ok(0),
        Err(e) => e,
    };

    match e.downcast_ref::<UsageError>() {
        Some(usage) => {
            warn!("{}", usage);
            writeln!(out, "{}", usage_text(usage.command()))?;
            Ok(1)
        }
        None => Err(e),
    }
}

fn usage_text(name: &str) -> String {
    let mut cmd = Args::command();
    let help = match cmd.find_subcommand_mut(name) {
        Some(sub) => sub.render_help(),
        None => cmd.render_help(),
    };
    help.to_string()
}
