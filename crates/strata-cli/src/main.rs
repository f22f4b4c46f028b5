use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use strata_cache::{CacheEngine, ConcreteResource, Location};
use strata_config::StrataConfig;

#[derive(Parser)]
#[command(name = "strata", version, about = "Strata tiered artifact cache")]
struct Cli {
    /// Config file (defaults to `$STRATA_CONFIG`, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the main-tier base directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what the cache knows about a resource
    Stat(StatArgs),
    /// Write a cached file to stdout, promoting it to the fast tier
    Cat(ResourceArg),
    /// Store stdin (or `--from`) as a resource
    Put(PutArgs),
    /// List a cached directory
    Ls(LsArgs),
    /// Delete a resource from both tiers
    Rm(ResourceArg),
    /// Copy one resource onto another
    Cp(PairArgs),
    /// Make `to` an alias of `from`
    Alias(PairArgs),
    /// Create a directory in both tiers
    Mkdir(ResourceArg),
    /// Create an empty file if it does not exist
    Touch(ResourceArg),
    /// Print the on-disk path of a resource
    Path(PathArgs),
    /// List configured locations
    Locations,
}

/// Resources are written `location:path`; `location:` names the location root.
#[derive(Args)]
struct ResourceArg {
    resource: String,
}

#[derive(Args)]
struct StatArgs {
    resource: String,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PutArgs {
    resource: String,
    /// Read content from this file instead of stdin
    #[arg(long)]
    from: Option<PathBuf>,
}

#[derive(Args)]
struct LsArgs {
    resource: String,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PairArgs {
    from: String,
    to: String,
}

#[derive(Args)]
struct PathArgs {
    resource: String,
    /// Materialize the resource in its fastest tier and print that path
    #[arg(long)]
    detached: bool,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = StrataConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(base_dir) = cli.base_dir {
        config.cache.base_dir = base_dir;
    }
    strata_config::init_tracing(&config.logging);

    if let Command::Locations = cli.command {
        for location in &config.locations {
            match &location.uri {
                Some(uri) => println!("{}\t{uri}", location.name),
                None => println!("{}", location.name),
            }
        }
        return Ok(0);
    }

    let engine = CacheEngine::new(config.cache.clone());
    tracing::debug!(
        target = "strata.cli",
        base_dir = %config.cache.base_dir.display(),
        "opened cache"
    );
    let session = Session { config, engine };

    match cli.command {
        Command::Stat(args) => session.stat(&args),
        Command::Cat(args) => session.cat(&args.resource),
        Command::Put(args) => session.put(&args),
        Command::Ls(args) => session.ls(&args),
        Command::Rm(args) => {
            let resource = session.resource(&args.resource)?;
            if session.engine.delete(&resource)? {
                Ok(0)
            } else {
                eprintln!("strata: {resource}: not found");
                Ok(1)
            }
        }
        Command::Cp(args) => {
            let from = session.resource(&args.from)?;
            let to = session.resource(&args.to)?;
            session.not_found_is_exit_1(session.engine.copy(&from, &to))
        }
        Command::Alias(args) => {
            let from = session.resource(&args.from)?;
            let to = session.resource(&args.to)?;
            session.not_found_is_exit_1(session.engine.create_alias(&from, &to))
        }
        Command::Mkdir(args) => {
            session.engine.mkdirs(&session.resource(&args.resource)?)?;
            Ok(0)
        }
        Command::Touch(args) => {
            session.engine.create_file(&session.resource(&args.resource)?)?;
            Ok(0)
        }
        Command::Path(args) => {
            let resource = session.resource(&args.resource)?;
            let path = if args.detached {
                session.engine.detached_file(&resource)?
            } else {
                session.engine.file_path(&resource)
            };
            println!("{}", path.display());
            Ok(0)
        }
        Command::Locations => Ok(0),
    }
}

struct Session {
    config: StrataConfig,
    engine: CacheEngine,
}

#[derive(Serialize)]
struct Stat {
    resource: String,
    exists: bool,
    directory: bool,
    file: bool,
    length: u64,
    /// Seconds since the Unix epoch.
    last_modified: Option<u64>,
    path: PathBuf,
}

impl Session {
    /// Unknown location names get an attribute-less location, so they live under the
    /// base directory and have no fast tier.
    fn resource(&self, raw: &str) -> Result<ConcreteResource> {
        let Some((name, path)) = raw.split_once(':') else {
            bail!("expected `location:path`, got {raw:?}");
        };
        if name.is_empty() {
            bail!("missing location name in {raw:?}");
        }
        let location = self
            .config
            .location(name)
            .unwrap_or_else(|| Arc::new(Location::new(name)));
        if path.is_empty() {
            return Ok(ConcreteResource::root(location));
        }
        Ok(ConcreteResource::new(location, path)?)
    }

    fn not_found_is_exit_1(&self, result: strata_cache::Result<()>) -> Result<i32> {
        match result {
            Ok(()) => Ok(0),
            Err(err) if err.is_not_found() => {
                eprintln!("strata: {err}");
                Ok(1)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn stat(&self, args: &StatArgs) -> Result<i32> {
        let resource = self.resource(&args.resource)?;
        let stat = Stat {
            resource: resource.to_string(),
            exists: self.engine.exists(&resource),
            directory: self.engine.is_directory(&resource),
            file: self.engine.is_file(&resource),
            length: self.engine.length(&resource),
            last_modified: self
                .engine
                .last_modified(&resource)
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs()),
            path: self.engine.resolver().fastest_existing(&resource),
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&stat)?);
        } else {
            println!("resource: {}", stat.resource);
            println!("  exists: {}", stat.exists);
            let kind = match (stat.directory, stat.file) {
                (true, _) => "directory",
                (_, true) => "file",
                _ => "-",
            };
            println!("  kind: {kind}");
            println!("  length: {}", stat.length);
            if let Some(secs) = stat.last_modified {
                println!("  last_modified: {secs}");
            }
            println!("  path: {}", stat.path.display());
        }
        Ok(if stat.exists { 0 } else { 1 })
    }

    fn cat(&self, raw: &str) -> Result<i32> {
        let resource = self.resource(raw)?;
        let mut reader = match self.engine.open_input_stream(&resource) {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => {
                eprintln!("strata: {err}");
                return Ok(1);
            }
            Err(err) => return Err(err.into()),
        };

        let stdout = io::stdout();
        let mut out = stdout.lock();
        io::copy(&mut reader, &mut out).with_context(|| format!("reading {resource}"))?;
        out.flush()?;
        // Waits for any fast-tier promotion started by the read.
        reader.close().with_context(|| format!("closing {resource}"))?;
        Ok(0)
    }

    fn put(&self, args: &PutArgs) -> Result<i32> {
        let resource = self.resource(&args.resource)?;
        let mut input: Box<dyn Read> = match &args.from {
            Some(path) => Box::new(
                std::fs::File::open(path)
                    .with_context(|| format!("opening {}", path.display()))?,
            ),
            None => Box::new(io::stdin().lock()),
        };

        let mut writer = self.engine.open_output_stream(&resource)?;
        if let Err(err) = io::copy(&mut input, &mut writer) {
            writer.abort();
            return Err(err).with_context(|| format!("writing {resource}"));
        }
        writer.commit()?;
        Ok(0)
    }

    fn ls(&self, args: &LsArgs) -> Result<i32> {
        let resource = self.resource(&args.resource)?;
        let Some(mut names) = self.engine.list(&resource) else {
            eprintln!("strata: {resource}: not a directory");
            return Ok(1);
        };
        names.sort();

        if args.json {
            println!("{}", serde_json::to_string_pretty(&names)?);
        } else {
            for name in names {
                println!("{name}");
            }
        }
        Ok(0)
    }
}
