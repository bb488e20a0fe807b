#![forbid(unsafe_code)]

use clap::Parser;
use pfs_check::CheckOptions;
use pfs_error::{FSCK_OK, FSCK_USAGE};
use std::path::PathBuf;
use std::process::ExitCode;

/// Check a polyfs filesystem image, optionally extracting its contents.
#[derive(Parser)]
#[command(name = "polyfsck", disable_version_flag = true)]
struct Cli {
    /// Be more verbose: -v lists every inode, -vv adds block traces.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Extract the filesystem into DIR.
    #[arg(short = 'x', value_name = "DIR")]
    extract: Option<PathBuf>,

    /// Image file or block device to test.
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // -h lands here too; only real argument problems are usage
            // errors with the fsck exit code.
            let code = if err.kind() == clap::error::ErrorKind::DisplayHelp {
                FSCK_OK
            } else {
                FSCK_USAGE
            };
            let _ = err.print();
            return ExitCode::from(code as u8);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = CheckOptions {
        verbosity: cli.verbose,
        extract: cli.extract,
    };

    match pfs_check::run(&cli.file, &options) {
        Ok(()) => {
            if cli.verbose > 0 {
                println!("{}: OK", cli.file.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("polyfsck: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
