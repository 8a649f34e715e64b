use std::error::Error;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use ra65::host::{DiskHost, Host};
use ra65::{module_from_text, parse_defines, SourceOptions};
use tracing::Level;

/// Assembles 6502 source into a relocatable module file.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source or module file
    #[arg(required_unless_present = "stdin")]
    source: Option<PathBuf>,

    /// Read source from standard input instead of a file
    #[arg(long, conflicts_with = "source")]
    stdin: bool,

    /// Output file (default: the source name with `.o`)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pre-defined symbols (repeatable)
    #[arg(short = 'D', long, value_name = "NAME[=val]", value_parser = parse_defines)]
    define: Vec<(String, i64)>,

    /// Search directories for included files
    #[arg(short = 'I', long)]
    include: Vec<PathBuf>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = main_real(args) {
        tracing::error!("{e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_real(args: Args) -> Result<(), Box<dyn Error>> {
    let host = DiskHost;
    let (text, name) = if args.stdin {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        (text, "stdin".to_string())
    } else {
        let path = args.source.as_ref().ok_or("no source file")?;
        let name = path.to_string_lossy().into_owned();
        (host.read_string(&name)?, name)
    };
    let opts = SourceOptions {
        include_paths: include_paths(args.source.as_deref(), &args.include),
        defines: args.define.clone(),
    };
    let module = module_from_text(&host, &text, &name, &opts)?;
    let json = serde_json::to_string_pretty(&module)?;
    match output_path(&args) {
        Some(path) => host.write_string(&path, &json)?,
        None => println!("{json}"),
    }
    Ok(())
}

/// The source file's own directory is searched first, then `-I` paths
/// in order.
fn include_paths(source: Option<&Path>, extra: &[PathBuf]) -> Vec<String> {
    let dir = source
        .and_then(Path::parent)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut paths = vec![dir];
    paths.extend(extra.iter().map(|p| p.to_string_lossy().into_owned()));
    paths
}

/// `-o` wins; otherwise the source name with `.o`.  Stdin input with
/// no `-o` writes to stdout.
fn output_path(args: &Args) -> Option<String> {
    if let Some(out) = &args.output {
        return Some(out.to_string_lossy().into_owned());
    }
    args.source
        .as_ref()
        .map(|p| p.with_extension("o").to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn output_defaults_to_the_source_stem() {
        let args = parse(&["ra65", "src/game.s"]);
        assert_eq!(output_path(&args).as_deref(), Some("src/game.o"));
        let args = parse(&["ra65", "game.s", "-o", "build/game.o"]);
        assert_eq!(output_path(&args).as_deref(), Some("build/game.o"));
        let args = parse(&["ra65", "--stdin"]);
        assert_eq!(output_path(&args), None);
    }

    #[test]
    fn the_source_directory_heads_the_include_path() {
        let args = parse(&["ra65", "src/game.s", "-I", "lib"]);
        assert_eq!(
            include_paths(args.source.as_deref(), &args.include),
            vec!["src".to_string(), "lib".to_string()]
        );
        assert_eq!(
            include_paths(None, &[]),
            vec![String::new()]
        );
    }

    #[test]
    fn defines_ride_the_flag() {
        let args = parse(&["ra65", "game.s", "-D", "DEBUG", "-D", "BANK=$10"]);
        assert_eq!(
            args.define,
            vec![("DEBUG".to_string(), 1), ("BANK".to_string(), 16)]
        );
    }

    #[test]
    fn source_or_stdin_is_required() {
        assert!(Args::try_parse_from(["ra65"]).is_err());
        assert!(Args::try_parse_from(["ra65", "a.s", "--stdin"]).is_err());
    }
}
