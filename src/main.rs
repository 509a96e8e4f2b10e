//! Tierjit CLI
//!
//! Drives synthetic workloads through the tiering core and prints what it
//! decided.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tierjit::{
    BytecodeHandle, CacheEntryKind, FunctionDescriptor, FunctionId, JitConfig, JitRuntime, ObjectId, PropertyId,
    PropertySlot, ShapeTable, SlotInfo, TypeId, UnitKind, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tierjit")]
#[command(author, version, about = "Adaptive tiered execution core for a managed-language runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file (TIERJIT_* variables still apply on top)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic call workload and report the tiering decisions
    Simulate {
        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 500)]
        calls: u32,

        /// Distinct shapes observed at the property site
        #[arg(short = 'k', long, default_value_t = 1)]
        shapes: u32,

        /// Invalidate the prototype property guard before this call
        #[arg(long, value_name = "CALL")]
        mutate_at: Option<u32>,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

const SIMULATED_FUNCTION: FunctionId = FunctionId(0);
const OWN_PROPERTY: PropertyId = PropertyId(0);
const PROTO_PROPERTY: PropertyId = PropertyId(1);

fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Simulate { calls, shapes, mutate_at, json } => simulate(config, calls, shapes, mutate_at, json),
        Commands::Config => show_config(&config),
    });
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<JitConfig> {
    let mut config = match path {
        Some(path) => JitConfig::from_file(path).with_context(|| format!("loading '{}'", path.display()))?,
        None => JitConfig::default(),
    };
    config.apply_env(std::env::vars()).context("reading TIERJIT_* variables")?;
    Ok(config)
}

fn show_config(config: &JitConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn simulate(config: JitConfig, calls: u32, shape_count: u32, mutate_at: Option<u32>, json: bool) -> anyhow::Result<()> {
    let background = config.background_compilation;
    let mut runtime = JitRuntime::new(config)?;
    runtime.register_unit(
        &FunctionDescriptor::new(SIMULATED_FUNCTION, vec![OWN_PROPERTY, PROTO_PROPERTY]),
        UnitKind::Function,
        BytecodeHandle::new(vec![0u8; 64]),
    );

    let table = ShapeTable::new();
    let shapes: Vec<_> = (0..shape_count.max(1))
        .map(|_| table.create_with(TypeId(1), &[(OWN_PROPERTY, PropertySlot::inline(0))]))
        .collect();
    let proto_load = SlotInfo::local(0).with_kind(CacheEntryKind::Proto { prototype: ObjectId(1), is_missing: false });

    for call in 0..calls {
        if mutate_at == Some(call) {
            let hit = runtime.invalidate_property(PROTO_PROPERTY);
            tracing::info!(call, hit, "prototype property overwritten");
        }

        let target = runtime.on_call(SIMULATED_FUNCTION)?;
        tracing::trace!(call, ?target, "call");

        let shape = &shapes[call as usize % shapes.len()];
        runtime.record_property_access(SIMULATED_FUNCTION, 0, shape, SlotInfo::local(0))?;
        runtime.record_property_access(SIMULATED_FUNCTION, 1, shape, proto_load)?;
        runtime.safe_point();
    }
    if background {
        runtime.wait_for_background(Duration::from_millis(200));
    }

    let diagnostics = runtime.diagnostics(SIMULATED_FUNCTION)?;
    if json {
        let report = serde_json::json!({
            "version": VERSION,
            "unit": diagnostics,
            "stats": runtime.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Tierjit {} - {} calls, {} shape(s)", VERSION, calls, shapes.len());
    println!();
    println!(
        "Unit {}: phase {:?}, running {}, {} interpreted call(s), {} to full JIT",
        diagnostics.function,
        diagnostics.phase,
        diagnostics.running_mode,
        diagnostics.interpreted_count,
        diagnostics.full_jit_distance
    );
    for entry in &diagnostics.entries {
        let marker = if entry.index == diagnostics.default_entry { "*" } else { " " };
        println!("  {} entry {:>2}  {:<16} {:?}", marker, entry.index, entry.mode.to_string(), entry.state);
    }
    for site in &diagnostics.sites {
        println!(
            "  site {} ({}): {:?}, {} shape(s), {:.1}% hits",
            site.index,
            site.property,
            site.state,
            site.shapes,
            site.stats.hit_rate()
        );
    }
    println!();
    print!("{}", runtime.summary());
    Ok(())
}
