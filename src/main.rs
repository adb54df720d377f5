mod config;
mod mem_soc;
mod simple_objects;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use config::{SystemConfig, Topology};
use mem_soc::error::SimError;
use mem_soc::simulator::{ExitCause, Tick};
use simple_objects::simple_memory::SimpleMemory;
use simple_objects::system::build_system;

/// Event driven simulator for a blocking single block cache and a blocking memory object
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON system description, the built in defaults are used without it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// override the topology of the config: cache or mem_obj
    #[arg(short, long)]
    topology: Option<Topology>,

    /// ELF image loaded into the memory before the simulation starts
    #[arg(short, long)]
    elf: Option<PathBuf>,

    /// stop once the simulation reaches this tick
    #[arg(long)]
    max_tick: Option<Tick>,

    /// tracing filter, e.g. "info" or "memsys_sim=trace"
    #[arg(long, default_value = "info")]
    log: String,
}

fn run(args: &Args) -> Result<(), SimError> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::from_file(path)?,
        None => SystemConfig::default(),
    };
    if let Some(topology) = args.topology {
        config.topology = topology;
    }

    let mut system = build_system(&config)?;
    if let Some(elf) = &args.elf {
        let memory = system.memory;
        if let Some(memory) = system.sim.object_mut::<SimpleMemory>(memory) {
            let sections = memory.load_elf(elf)?;
            tracing::info!("Loaded {sections} sections from {}", elf.display());
        }
    }

    if let Some(memory) = system.sim.object::<SimpleMemory>(system.memory) {
        tracing::info!("{:?} system, memory {}", config.topology, memory.range());
    }
    system.sim.init()?;
    let cause = system.sim.run(args.max_tick)?;
    match cause {
        ExitCause::QueueEmpty => tracing::info!("Simulation finished @{}", system.sim.cur_tick()),
        ExitCause::TickLimit(tick) => tracing::warn!("Simulation stopped at the tick limit @{tick}"),
    }

    for completion in system.completions.try_iter() {
        println!(
            "{:<24} #{:<4} {:?} {:#010x} {:?} {:02X?} [{} -> {}]",
            completion.generator,
            completion.id,
            completion.request_type,
            completion.address,
            completion.status,
            completion.data,
            completion.issued_at,
            completion.completed_at
        );
    }
    println!("\n---------- Begin Simulation Statistics ----------");
    print!("{}", system.sim.dump_stats());
    println!("---------- End Simulation Statistics   ----------");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    fmt::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    tracing::info!("Initializing memory system simulation");
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
