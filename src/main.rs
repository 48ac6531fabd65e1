use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use odoo_kopia_lib::backends::{Kopia, Postgres};
use odoo_kopia_lib::cli::{Action, Cli};
use odoo_kopia_lib::config::{self, KOPIA_PASSWORD};
use odoo_kopia_lib::error::Error;
use odoo_kopia_lib::kube;
use odoo_kopia_lib::orchestrator::{list_snapshots, render, run_backup, run_restore};
use odoo_kopia_lib::util::CancelToken;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    match run(cli.action) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.kind();
            log::error!("{e}");
            log::debug!("Exiting with {kind} ({})", kind.exit_code());
            ExitCode::from(kind.exit_code())
        }
    }
}

fn run(action: Action) -> Result<(), Error> {
    let cancel = CancelToken::new();

    match action {
        Action::Backup(args) => {
            config::require_env(&[KOPIA_PASSWORD], config::env_var)?;
            let backup_run = args.backup_run(config::env_var)?;
            cancel.install_handler()?;

            let kopia = Kopia::new(args.kopia.settings(), cancel.clone());
            let postgres = Postgres::new(cancel);
            let report = run_backup(&backup_run, &kopia, &postgres)?;
            for kept in &report.kept {
                log::info!(target: "orchestrator::backup", "Kept {}", kept.display());
            }
        }
        Action::Restore(args) => {
            config::require_env(&[KOPIA_PASSWORD], config::env_var)?;
            let plan = args.request().validate(config::env_var)?;
            cancel.install_handler()?;

            let kopia = Kopia::new(args.kopia.settings(), cancel.clone());
            let postgres = Postgres::new(cancel);
            run_restore(&plan, &kopia, &postgres)?;
        }
        Action::List(args) => {
            config::require_env(&[KOPIA_PASSWORD], config::env_var)?;
            cancel.install_handler()?;

            let kopia = Kopia::new(args.kopia.settings(), cancel);
            let snapshots = list_snapshots(&kopia, &args.query())?;

            let mut stdout = io::stdout().lock();
            render(&snapshots, args.format(), &mut stdout)?;
            stdout.flush()?;
        }
        Action::GenerateBackupManifest(args) => print_manifest(&kube::render(&args.spec())?)?,
        Action::GenerateRestoreManifest(args) => print_manifest(&kube::render(&args.spec())?)?,
    }

    Ok(())
}

fn print_manifest(yaml: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(yaml.as_bytes())?;
    stdout.flush()
}
