//! The `ept` command line front end.

use clap::{Args, Parser, Subcommand};

use ept_rs::builder::Threads;
use ept_rs::config::{self, Config, Scale};
use ept_rs::manifest;
use ept_rs::metadata::{Reprojection, Subset};
use ept_rs::pipeline::Pipeline;
use ept_rs::{merge, scan, Error, Result};

#[derive(Parser)]
#[command(name = "ept", version, about = "Entwine Point Tile batch indexer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index inputs into an EPT dataset
    Build(BuildArgs),
    /// Inspect inputs and write an ept-scan.json artifact
    Scan(ScanArgs),
    /// Combine completed subset builds into one EPT dataset
    Merge(MergeArgs),
    /// Inspect inputs and print aggregate info as JSON
    Info(ScanArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// JSON config file used as a base under the explicit flags
    #[arg(long)]
    config: Option<String>,
    /// Input file, glob, or ept-scan.json
    #[arg(short, long)]
    input: Vec<String>,
    /// Output directory
    #[arg(short, long)]
    output: Option<String>,
    #[arg(short, long)]
    threads: Option<u64>,
    /// Overwrite any existing dataset at the output
    #[arg(short, long)]
    force: bool,
    /// Chunk storage: laszip, zstandard, or binary
    #[arg(long = "dataType")]
    data_type: Option<String>,
    /// Voxel grid resolution per chunk
    #[arg(long)]
    span: Option<u64>,
    /// Explicit bounds as "[xmin,ymin,zmin,xmax,ymax,zmax]"
    #[arg(long)]
    bounds: Option<String>,
    /// Coordinate scale: a number or "[sx,sy,sz]"
    #[arg(long)]
    scale: Option<String>,
    /// Store coordinates as absolute doubles
    #[arg(long)]
    absolute: bool,
    /// Do not track per-point file origins
    #[arg(long = "noOriginId")]
    no_origin_id: bool,
    /// Stop after this many files
    #[arg(long)]
    limit: Option<u64>,
    /// Read every point record during the scan phase
    #[arg(long)]
    deep: bool,
    /// Build one slab of a partitioned build: --subset <id> <of>
    #[arg(long, num_args = 2, value_names = ["ID", "OF"])]
    subset: Option<Vec<u64>>,
    #[arg(long = "maxNodeSize")]
    max_node_size: Option<u64>,
    #[arg(long = "minNodeSize")]
    min_node_size: Option<u64>,
    #[arg(long = "cacheSize")]
    cache_size: Option<u64>,
    #[arg(long = "hierarchyStep")]
    hierarchy_step: Option<u64>,
    #[arg(long = "sleepCount")]
    sleep_count: Option<u64>,
    /// Seconds between progress lines (0 disables)
    #[arg(long)]
    progress: Option<u64>,
    /// Force LAS 1.4 point formats for laszip output
    #[arg(long = "laz_14")]
    laz_14: bool,
    /// Reprojection as "in,out" or "out", with ",hammer" to override
    /// file headers
    #[arg(long)]
    reprojection: Option<String>,
    /// Scratch directory for staged downloads
    #[arg(long)]
    tmp: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long)]
    config: Option<String>,
    #[arg(short, long)]
    input: Vec<String>,
    #[arg(short, long)]
    output: Option<String>,
    #[arg(short, long)]
    threads: Option<u64>,
    /// Read every point record for exact bounds and stats
    #[arg(long)]
    deep: bool,
    #[arg(long)]
    tmp: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(long)]
    config: Option<String>,
    #[arg(short, long)]
    output: Option<String>,
    #[arg(short, long)]
    threads: Option<u64>,
    #[arg(short, long)]
    force: bool,
    #[arg(short, long)]
    verbose: bool,
}

fn parse_reprojection(s: &str) -> Reprojection {
    let mut parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let hammer = parts.last() == Some(&"hammer");
    if hammer {
        parts.pop();
    }
    match parts.as_slice() {
        [out] => Reprojection {
            in_srs: String::new(),
            out_srs: out.to_string(),
            hammer,
        },
        [input, out, ..] => Reprojection {
            in_srs: input.to_string(),
            out_srs: out.to_string(),
            hammer,
        },
        [] => Reprojection::default(),
    }
}

impl BuildArgs {
    fn into_config(self) -> Result<Config> {
        let mut c = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        c.input.extend(self.input);
        if let Some(output) = self.output {
            c.output = output;
        }
        if let Some(threads) = self.threads {
            c.threads = threads;
        }
        c.force |= self.force;
        if let Some(dt) = self.data_type {
            c.data_type = Some(dt.parse()?);
        }
        if let Some(span) = self.span {
            c.span = Some(span);
        }
        if let Some(b) = self.bounds {
            c.bounds = Some(
                serde_json::from_str(&b)
                    .map_err(|e| Error::Config(format!("bad --bounds: {e}")))?,
            );
        }
        if let Some(s) = self.scale {
            c.scale = Some(
                serde_json::from_str::<Scale>(&s)
                    .map_err(|e| Error::Config(format!("bad --scale: {e}")))?,
            );
        }
        c.absolute |= self.absolute;
        c.no_origin_id |= self.no_origin_id;
        if let Some(limit) = self.limit {
            c.limit = limit;
        }
        c.deep |= self.deep;
        if let Some(subset) = self.subset {
            c.subset = Some(Subset {
                id: subset[0],
                of: subset[1],
            });
        }
        if let Some(v) = self.max_node_size {
            c.max_node_size = Some(v);
        }
        if let Some(v) = self.min_node_size {
            c.min_node_size = Some(v);
        }
        if let Some(v) = self.cache_size {
            c.cache_size = Some(v);
        }
        if let Some(v) = self.hierarchy_step {
            c.hierarchy_step = Some(v);
        }
        if let Some(v) = self.sleep_count {
            c.sleep_count = Some(v);
        }
        if let Some(v) = self.progress {
            c.progress = Some(v);
        }
        c.laz_14 |= self.laz_14;
        if let Some(r) = self.reprojection {
            c.reprojection = Some(parse_reprojection(&r));
        }
        if let Some(tmp) = self.tmp {
            c.tmp = Some(tmp);
        }
        c.verbose |= self.verbose;
        Ok(c)
    }
}

impl ScanArgs {
    fn into_config(self) -> Result<Config> {
        let mut c = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        c.input.extend(self.input);
        if let Some(output) = self.output {
            c.output = output;
        }
        if let Some(threads) = self.threads {
            c.threads = threads;
        }
        c.deep |= self.deep;
        if let Some(tmp) = self.tmp {
            c.tmp = Some(tmp);
        }
        c.verbose |= self.verbose;
        Ok(c)
    }
}

fn build(args: BuildArgs) -> Result<()> {
    let config = args.into_config()?;
    let threads = Threads::split(config.threads());
    let limit = config.limit;
    let progress = config.progress_interval();

    let mut builder = config::resolve(&config)?;
    let inserted = builder.run(threads, limit, progress)?;

    let errors: usize = builder
        .manifest
        .iter()
        .map(|i| i.source.info.errors.len())
        .sum();
    println!(
        "Done: {} points inserted across {} files ({} file errors)",
        ept_rs::builder::commify(inserted),
        builder.manifest.iter().filter(|i| i.inserted).count(),
        errors,
    );
    Ok(())
}

fn run_scan(args: ScanArgs) -> Result<()> {
    let config = args.into_config()?;
    let inputs = config::expand_inputs(&config.input)?;
    let endpoints = config.endpoints()?;
    let pipeline = config.pipeline.clone().unwrap_or_else(Pipeline::reader_only);

    let scan = scan::run(
        &inputs,
        &pipeline,
        &config.input_store(),
        &endpoints,
        config.threads(),
        config.deep,
        config.verbose,
    )?;
    println!(
        "Scanned {} files: {} points",
        scan.sources.len(),
        ept_rs::builder::commify(scan.summary.points),
    );
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    config.force |= args.force;
    config.verbose |= args.verbose;

    merge::merge(
        config.endpoints()?,
        config.input_store(),
        config.threads(),
        config.force,
        config.verbose,
    )
}

fn info(args: ScanArgs) -> Result<()> {
    let config = args.into_config()?;
    let inputs = config::expand_inputs(&config.input)?;
    if inputs.is_empty() {
        return Err(Error::Config("no inputs given".to_string()));
    }
    let pipeline = config.pipeline.clone().unwrap_or_else(Pipeline::reader_only);
    let tmp = config
        .tmp
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let sources = scan::analyze(
        &inputs,
        &pipeline,
        &config.input_store(),
        &tmp,
        config.threads(),
        config.deep,
        config.verbose,
    );
    let summary = manifest::reduce(&sources);

    let out = serde_json::json!({
        "summary": summary,
        "sources": sources,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn main() -> std::process::ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build(args) => build(args),
        Command::Scan(args) => run_scan(args),
        Command::Merge(args) => run_merge(args),
        Command::Info(args) => info(args),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
