use std::path::PathBuf;
use std::process;

use clap::Parser;
use odinpatch::*;

/// Neutralize the SignerVer02 block of a recovery image and repackage it as
/// an Odin-flashable `.tar.md5`. With no options the fixed file names in the
/// current directory are used.
#[derive(Parser, Debug)]
#[command(
    name = "odinpatch",
    version,
    about = "Patch out the SignerVer02 block of a recovery image and build an Odin .tar.md5"
)]
struct Cli {
    /// Source recovery image
    #[arg(short = 'i', long = "input", default_value = DEFAULT_INPUT)]
    input: PathBuf,

    /// Backup copy of the untouched source
    #[arg(short = 'b', long = "backup", default_value = DEFAULT_BACKUP)]
    backup: PathBuf,

    /// Patched image
    #[arg(short = 'o', long = "output", default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Odin archive (".md5" is appended when missing)
    #[arg(short = 'a', long = "archive", default_value = DEFAULT_ARCHIVE)]
    archive: PathBuf,

    /// Name of the image inside the archive
    #[arg(short = 'n', long = "entry-name", default_value = ODIN_ENTRY_NAME)]
    entry_name: String,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode: print only the checksum
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let params = PatchParams::builder()
        .input(cli.input)
        .backup(cli.backup)
        .output(cli.output)
        .archive(cli.archive)
        .entry_name(&cli.entry_name)
        .build();

    let quiet = cli.quiet;
    let result = run_with_progress(&params, |step| {
        if quiet {
            return;
        }
        match step {
            Progress::BackupCreated { path } => {
                println!("Backup created: {}", path.display());
            }
            Progress::RegionPatched { outcome } => {
                if outcome.already_neutralized {
                    println!(
                        "SignerVer02 region at 0x{:08x} was already cleared",
                        outcome.offset
                    );
                } else {
                    println!(
                        "Cleared SignerVer02 region at 0x{:08x} ({} bytes)",
                        outcome.offset, outcome.region_size
                    );
                }
            }
            Progress::ImageWritten { path } => {
                println!("Wrote fixed image: {}", path.display());
            }
            Progress::Packaged { info } => {
                println!("Created Odin-compatible file: {}", info.archive.display());
            }
        }
    });

    match result {
        Ok(report) => {
            println!("MD5: {}", report.package.md5);
        }
        Err(e) => {
            eprintln!("odinpatch: {}", e);
            process::exit(1);
        }
    }
}
