use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use indexmap::IndexMap;
use serde_derive::Deserialize;
use tracing::Level;

use ra65::host::{DiskHost, Host};
use ra65::link::Linker;
use ra65::module::Segment;
use ra65::{module_from_text, parse_defines, SourceOptions};

/// Links relocatable modules into a binary or an IPS patch.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Module or source files, linked in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output file (default: the first input with `.nes`, or `.ips`)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Layout preset (`sim` or `nes-nrom`)
    #[arg(long)]
    target: Option<String>,

    /// TOML segment layout, replacing any preset
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base image to patch over
    #[arg(short, long)]
    rom: Option<PathBuf>,

    /// Emit an IPS patch against the base image instead of a binary
    #[arg(long)]
    ips: bool,

    /// Write a plain-text map of chunks and symbols here
    #[arg(long, value_name = "FILE")]
    dbgfile: Option<PathBuf>,

    /// Pre-defined symbols for source inputs (repeatable)
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
    let mut linker = Linker::new(args.target.as_deref())?;
    if let Some(config) = &args.config {
        let text = host.read_string(&config.to_string_lossy())?;
        linker.segments(layout_segments(&text)?);
    }
    let rom = match &args.rom {
        Some(path) => {
            let data = host.read_bytes(&path.to_string_lossy())?;
            linker.base(&data, 0);
            Some(data)
        }
        None => None,
    };
    for file in &args.files {
        let name = file.to_string_lossy().into_owned();
        let text = host.read_string(&name)?;
        let opts = SourceOptions {
            include_paths: include_paths(file, &args.include),
            defines: args.define.clone(),
        };
        linker.read(module_from_text(&host, &text, &name, &opts)?)?;
    }
    let out = linker.link()?;
    let data = if args.ips {
        out.to_ips_patch()
    } else if let Some(mut image) = rom {
        if image.len() < out.len() {
            image.resize(out.len(), 0);
        }
        out.apply(&mut image);
        image
    } else {
        out.into_bytes()
    };
    host.write_bytes(&output_path(&args), &data)?;
    if let Some(dbg) = &args.dbgfile {
        host.write_string(&dbg.to_string_lossy(), &linker.debug_map())?;
    }
    Ok(())
}

fn include_paths(source: &Path, extra: &[PathBuf]) -> Vec<String> {
    let dir = source
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut paths = vec![dir];
    paths.extend(extra.iter().map(|p| p.to_string_lossy().into_owned()));
    paths
}

/// `-o` wins; otherwise the first input's stem with `.ips` for patches
/// and `.nes` for binaries.
fn output_path(args: &Args) -> String {
    if let Some(out) = &args.output {
        return out.to_string_lossy().into_owned();
    }
    let ext = if args.ips { "ips" } else { "nes" };
    args.files[0]
        .with_extension(ext)
        .to_string_lossy()
        .into_owned()
}

/// A number as TOML gives it: bare, or a string with the assembler's
/// `$` and `%` radix prefixes.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Num {
    Int(i64),
    Text(String),
}

impl Num {
    fn value(&self) -> Result<i64, Box<dyn Error>> {
        match self {
            Num::Int(v) => Ok(*v),
            Num::Text(s) => {
                let s = s.trim();
                Ok(if let Some(hex) = s.strip_prefix('$') {
                    i64::from_str_radix(hex, 16)?
                } else if let Some(bin) = s.strip_prefix('%') {
                    i64::from_str_radix(bin, 2)?
                } else {
                    s.parse()?
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LayoutFile {
    #[serde(default)]
    segments: IndexMap<String, LayoutSegment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayoutSegment {
    bank: Option<Num>,
    size: Option<Num>,
    offset: Option<Num>,
    memory: Option<Num>,
    addressing: Option<Num>,
    fill: Option<Num>,
    out: Option<bool>,
    overlay: Option<String>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    free: Vec<(Num, Num)>,
}

/// Parses a `[segments.NAME]` layout file into a segment table, in
/// declaration order.
fn layout_segments(text: &str) -> Result<Vec<Segment>, Box<dyn Error>> {
    let layout: LayoutFile = toml::from_str(text)?;
    let mut segments = Vec::new();
    for (name, seg) in layout.segments {
        let mut free = Vec::new();
        for (a, b) in &seg.free {
            free.push((a.value()?, b.value()?));
        }
        segments.push(Segment {
            name,
            bank: num_field(&seg.bank)?,
            size: num_field(&seg.size)?,
            offset: num_field(&seg.offset)?,
            memory: num_field(&seg.memory)?,
            addressing: num_field(&seg.addressing)?,
            fill: num_field(&seg.fill)?,
            out: seg.out,
            overlay: seg.overlay,
            default: seg.default,
            free,
        });
    }
    Ok(segments)
}

fn num_field(num: &Option<Num>) -> Result<Option<i64>, Box<dyn Error>> {
    num.as_ref().map(Num::value).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn output_extension_tracks_the_mode() {
        let args = parse(&["rl65", "game.o"]);
        assert_eq!(output_path(&args), "game.nes");
        let args = parse(&["rl65", "game.o", "--ips", "-r", "base.nes"]);
        assert_eq!(output_path(&args), "game.ips");
        let args = parse(&["rl65", "game.o", "-o", "out.bin"]);
        assert_eq!(output_path(&args), "out.bin");
    }

    #[test]
    fn layouts_parse_radix_strings() {
        let segments = layout_segments(
            r#"
            [segments.code]
            size = "$8000"
            offset = 16
            memory = "$8000"
            default = true
            free = [["$8000", "$9000"], ["%1010000000000000", 41000]]

            [segments.chr]
            size = "$2000"
            offset = "$8010"
            memory = 0
            fill = "$ff"
            "#,
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, "code");
        assert_eq!(segments[0].size, Some(0x8000));
        assert_eq!(segments[0].offset, Some(16));
        assert!(segments[0].default);
        assert_eq!(segments[0].free, vec![(0x8000, 0x9000), (0xa000, 41000)]);
        assert_eq!(segments[1].fill, Some(0xff));
        assert!(!segments[1].default);
    }

    #[test]
    fn unknown_layout_fields_are_rejected() {
        assert!(layout_segments("[segments.code]\nsiz = 5").is_err());
    }

    #[test]
    fn at_least_one_input_is_required() {
        assert!(Args::try_parse_from(["rl65"]).is_err());
    }
}
