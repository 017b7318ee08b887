//! rewind CLI entry point.
//!
//! Runs an export of an Asyncify-instrumented module with the standard host
//! imports, awaiting every suspension, or inspects a module's imports,
//! exports and control surface.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use wasmtime::{Val, ValType};

use rewind_common::{ConfigFile, LoggingConfig, RuntimeConfig};
use rewind_core::{AsyncInstance, CompiledModule, ImportMap, WasmEngine};
use rewind_host::linker::register_all;

#[derive(Debug, Parser)]
#[command(name = "rewind", version, about = "Run Asyncify-instrumented WebAssembly with async host imports")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, global = true, env = "REWIND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call an export and print its results.
    Run {
        /// Module to load (`.wasm` or `.wat`).
        module: PathBuf,

        /// Export to call.
        export: String,

        /// Arguments, parsed according to the export's parameter types.
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,
    },

    /// List imports, exports and missing control exports.
    Inspect {
        /// Module to load (`.wasm` or `.wat`).
        module: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(&file.logging);

    match cli.command {
        Command::Run {
            module,
            export,
            args,
        } => run(&file.runtime, &module, &export, &args).await,
        Command::Inspect { module } => inspect(&file.runtime, &module),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    // Results go to stdout; logs go to stderr.
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(
    config: &RuntimeConfig,
    module: &Path,
    export: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let engine = WasmEngine::new(&config.engine).context("Failed to create engine")?;
    let compiled = CompiledModule::from_file(engine.inner(), module)
        .with_context(|| format!("Failed to load {}", module.display()))?;

    let mut imports = ImportMap::new();
    register_all(&mut imports, &config.host);

    let mut instance = AsyncInstance::new(&engine, &compiled, &imports, config)
        .context("Failed to instantiate module")?;

    let wrapped = instance
        .export(export)
        .with_context(|| format!("Export '{export}' not found"))?;

    let params: Vec<ValType> = wrapped.ty().params().collect();
    if params.len() != args.len() {
        bail!(
            "Export '{export}' takes {} arguments, {} given",
            params.len(),
            args.len()
        );
    }
    let values = args
        .iter()
        .zip(&params)
        .map(|(raw, ty)| parse_arg(raw, ty))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Epoch deadlines only advance while something increments the epoch.
    let ticker = engine.is_epoch_enabled().then(|| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        })
    });

    let result = instance.call_export(&wrapped, &values).await;
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    let results = result.with_context(|| format!("Call to '{export}' failed"))?;

    for value in &results {
        println!("{}", format_val(value));
    }

    let metrics = instance.metrics();
    info!(
        unwinds = metrics.unwinds,
        rewinds = metrics.rewinds,
        fuel_consumed = metrics.fuel_consumed,
        suspended_ms = metrics.suspended.as_millis(),
        "Run finished"
    );

    Ok(())
}

fn inspect(config: &RuntimeConfig, module: &Path) -> anyhow::Result<()> {
    let engine = WasmEngine::new(&config.engine).context("Failed to create engine")?;
    let compiled = CompiledModule::from_file(engine.inner(), module)
        .with_context(|| format!("Failed to load {}", module.display()))?;

    println!("imports:");
    for (module_name, name, kind) in compiled.imports() {
        println!("  {module_name}::{name} ({kind})");
    }

    println!("exports:");
    for (name, kind) in compiled.exports() {
        let marker = if config.asyncify.is_reserved(&name) {
            " [control]"
        } else {
            ""
        };
        println!("  {name} ({kind}){marker}");
    }

    let missing = compiled.missing_control_exports(&config.asyncify);
    if missing.is_empty() {
        println!("asyncify: instrumented");
    } else {
        println!("asyncify: missing {}", missing.join(", "));
    }

    Ok(())
}

fn parse_arg(raw: &str, ty: &ValType) -> anyhow::Result<Val> {
    let value = match ty {
        ValType::I32 => Val::I32(raw.parse().with_context(|| format!("'{raw}' is not an i32"))?),
        ValType::I64 => Val::I64(raw.parse().with_context(|| format!("'{raw}' is not an i64"))?),
        ValType::F32 => {
            let f: f32 = raw.parse().with_context(|| format!("'{raw}' is not an f32"))?;
            Val::F32(f.to_bits())
        }
        ValType::F64 => {
            let f: f64 = raw.parse().with_context(|| format!("'{raw}' is not an f64"))?;
            Val::F64(f.to_bits())
        }
        _ => bail!("Parameters of type {ty} cannot be passed from the command line"),
    };
    Ok(value)
}

fn format_val(value: &Val) -> String {
    match value {
        Val::I32(v) => v.to_string(),
        Val::I64(v) => v.to_string(),
        Val::F32(bits) => f32::from_bits(*bits).to_string(),
        Val::F64(bits) => f64::from_bits(*bits).to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("-7", &ValType::I32).unwrap().unwrap_i32(), -7);
        assert_eq!(parse_arg("9000000000", &ValType::I64).unwrap().unwrap_i64(), 9_000_000_000);
        assert_eq!(parse_arg("1.5", &ValType::F64).unwrap().unwrap_f64(), 1.5);
        assert!(parse_arg("abc", &ValType::I32).is_err());
        assert!(parse_arg("0", &ValType::EXTERNREF).is_err());
    }

    #[test]
    fn test_format_val() {
        assert_eq!(format_val(&Val::I32(42)), "42");
        assert_eq!(format_val(&Val::F32(2.5f32.to_bits())), "2.5");
    }

    #[test]
    fn test_cli_parses_negative_args() {
        let cli = Cli::try_parse_from(["rewind", "run", "m.wat", "E", "-3"]).unwrap();
        let Command::Run { args, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args, vec!["-3".to_string()]);
    }
}
