use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use nss_ndb::loader::{self, LoadOptions, Loader, RecordClass};
use nss_ndb::Generation;

/// Build ordered passwd and group indexes from colon-separated records.
#[derive(Debug, Parser)]
#[command(name = "makendb", version)]
struct Args {
    /// Record type: `passwd` writes .byname/.byuid, `group` also writes .byuser
    #[arg(short = 'T', long = "type", value_name = "TYPE")]
    class: Option<RecordClass>,

    /// Keep the first value for a repeated key and warn about the rest
    #[arg(short, long)]
    unique: bool,

    /// Field delimiter characters
    #[arg(short = 'D', long = "delimiter", default_value = ":")]
    delimiters: String,

    /// Report progress; repeat for per-index detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print the contents of DATABASE instead of loading it
    #[arg(short, long)]
    print: bool,

    /// With --print, prefix each value with its key
    #[arg(short, long, requires = "print")]
    keys: bool,

    /// Storage engine for databases that do not exist yet (sorted or redb)
    #[arg(short = 'E', long, default_value_t = Generation::Sorted)]
    engine: Generation,

    /// Database file, or the base name of the index set for --type
    database: PathBuf,

    /// Input file; standard input when absent
    source: Option<PathBuf>,
}

fn input(source: Option<&Path>) -> Result<Box<dyn BufRead>> {
    Ok(match source {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(io::stdin().lock()),
    })
}

fn print(args: &Args) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let count = loader::dump(&args.database, args.keys, &mut out)
        .with_context(|| format!("reading {}", loader::dump_path(&args.database).display()))?;
    out.flush()?;
    if args.verbose > 0 {
        eprintln!("{} entries", count);
    }
    Ok(())
}

fn build(args: &Args) -> Result<()> {
    let options = LoadOptions {
        class: args.class.unwrap_or_default(),
        unique: args.unique,
        delimiters: args.delimiters.clone(),
        generation: args.engine,
    };
    if options.delimiters.is_empty() {
        anyhow::bail!("the delimiter set is empty");
    }
    let paths = loader::IndexPaths::new(&args.database, options.class);
    if args.verbose > 1 {
        for path in [Some(&paths.by_name), paths.by_id.as_ref(), paths.by_member.as_ref()].into_iter().flatten() {
            eprintln!("writing {}", path.display());
        }
    }

    let mut loader = Loader::create(&args.database, options)
        .with_context(|| format!("opening {}", paths.by_name.display()))?;
    loader
        .load(input(args.source.as_deref())?, |warning| eprintln!("makendb: warning: {}", warning))
        .context("loading records")?;
    let stats = loader.finish().context("writing indexes")?;

    if args.verbose > 0 {
        eprintln!("{} entries imported ({} warnings)", stats.imported, stats.warnings);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = if args.print { print(&args) } else { build(&args) };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("makendb: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
