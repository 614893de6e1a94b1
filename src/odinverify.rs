use std::path::PathBuf;
use std::process;

use clap::Parser;
use odinpatch::*;

/// Check an Odin `.tar.md5` archive against its digest sidecar, list its
/// contents, or extract an entry.
#[derive(Parser, Debug)]
#[command(
    name = "odinverify",
    version,
    about = "Verify, list and extract Odin .tar.md5 archives"
)]
struct Cli {
    /// Verify the checksum and list the archive contents
    #[arg(short = 'l')]
    list: bool,

    /// Extract the entry at this position (starting at 0)
    #[arg(short = 'p', default_value = "0")]
    position: usize,

    /// Extract the entry to this file
    #[arg(short = 'o')]
    outfile: Option<PathBuf>,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// The archive to inspect
    #[arg()]
    archive: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // -l and -o are mutually exclusive
    if cli.list && cli.outfile.is_some() {
        eprintln!("odinverify: -l and -o are mutually exclusive");
        process::exit(1);
    }

    if !cli.list && cli.outfile.is_none() {
        eprintln!(
            "Usage: odinverify -l archive.tar.md5\n\
             \x20      odinverify [-p position] -o outfile archive.tar.md5"
        );
        process::exit(1);
    }

    if let Some(outfile) = &cli.outfile {
        match extract_entry(&cli.archive, cli.position, outfile) {
            Ok(entry) => {
                println!("Extracted {} to {}", entry.name, outfile.display());
            }
            Err(e) => {
                eprintln!(
                    "odinverify: Can't extract entry from {}: {}",
                    cli.archive.display(),
                    e
                );
                process::exit(1);
            }
        }
        return;
    }

    match verify_package(&cli.archive) {
        Ok(v) => print_package_info(&cli.archive, &v),
        Err(e) => {
            eprintln!("odinverify: {}: {}", cli.archive.display(), e);
            process::exit(1);
        }
    }
}
