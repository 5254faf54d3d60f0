/*!
 * Skyrun CLI - Command Line Interface
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use skyrun::{
    error::{RemoteError, EXIT_FATAL, EXIT_SUCCESS},
    logging, EventSink, LifecycleManager, ParameterStore, RemoteStore, SkyrunConfig, SshConnector,
    StatusEvent,
};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

#[derive(Parser)]
#[command(name = "skyrun")]
#[command(version, about = "Run models on ephemeral remote instances", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/skyrun/config.toml)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Owner of the instance (defaults to $USER)
    #[arg(short = 'n', long = "name", value_name = "USER", global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find or create the instance and log into it
    Ensure,

    /// Destroy the instance
    Destroy {
        /// Attempts before giving up (1 = single best-effort call)
        #[arg(long, default_value = "1")]
        retries: u32,
    },

    /// Destroy the instance again if the broker still lists it
    Reconcile,

    /// Export a structure tree
    Structure {
        table: String,
    },

    /// Export series for one or more IDs
    Values {
        table: String,

        #[arg(required = true)]
        ids: Vec<u32>,
    },

    /// Build the model's parameter database from an input file
    CreateParams {
        exe: String,
        input: String,
    },

    /// Write the model's parameters back to its input format
    ExportParams {
        exe: String,
    },

    /// Start a model run
    Run {
        exe: String,
        input: String,
        db: String,
    },

    /// Show how the broker lists the instance
    Status,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<RemoteError>()
                .map(RemoteError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(SkyrunConfig::default_path)
        .ok_or_else(|| anyhow!("Could not determine config directory; pass --config"))?;
    let mut config = SkyrunConfig::load(&config_path)
        .with_context(|| format!("Loading {}", config_path.display()))?;
    config.verbose |= cli.verbose;
    logging::init_logging(&config)?;

    let user = cli
        .name
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| anyhow!("No instance owner; pass --name"))?;

    let (events, rx) = EventSink::channel();
    let printer = spawn_printer(rx);

    let manager = LifecycleManager::new(SshConnector, config, events);
    let result = execute(cli.command, manager, &user);

    // The manager and its sink are gone once execute returns.
    let _ = printer.join();
    result
}

fn execute(
    command: Commands,
    mut manager: LifecycleManager<SshConnector>,
    user: &str,
) -> anyhow::Result<()> {
    match command {
        Commands::Ensure => {
            let instance = manager.ensure_instance(user)?;
            if let Some(ip) = instance.ip {
                println!("{} {}", instance.name, ip);
            }
        }
        Commands::Destroy { retries } => {
            manager.select_instance(user)?;
            if retries > 1 {
                manager.destroy_instance_with_retry(retries)?;
            } else {
                manager.destroy_instance()?;
            }
        }
        Commands::Reconcile => {
            let name = manager.config().instance_name(user)?;
            manager.mark_destroyed(&name);
            for name in manager.reconcile()? {
                println!("destroy re-issued for {}", name);
            }
        }
        Commands::Status => match manager.lookup(user)? {
            Some(listed) => println!("{} {} {}", listed.name, listed.ip, listed.status),
            None => println!("{} absent", manager.config().instance_name(user)?),
        },
        store_command => {
            let mut store = RemoteStore::new(manager);
            store.ensure(user)?;
            run_store_command(store_command, &mut store)?;
        }
    }
    Ok(())
}

fn run_store_command(command: Commands, store: &mut dyn ParameterStore) -> skyrun::Result<()> {
    match command {
        Commands::Structure { table } => {
            for entry in store.export_structure(&table)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.parent_id, entry.child_id, entry.name, entry.unit
                );
            }
        }
        Commands::Values { table, ids } => {
            let batch = store.export_values(&table, &ids)?;
            if let Some(start) = batch.start_datetime() {
                println!("start {}", start.to_rfc3339());
            }
            for (id, series) in ids.iter().zip(&batch.series) {
                println!(
                    "{}\t{} samples\t{} missing",
                    id,
                    series.len(),
                    series.missing_count()
                );
            }
        }
        Commands::CreateParams { exe, input } => store.create_parameter_store(&exe, &input)?,
        Commands::ExportParams { exe } => store.export_parameters(&exe)?,
        Commands::Run { exe, input, db } => store.run_model(&exe, &input, &db)?,
        Commands::Ensure
        | Commands::Destroy { .. }
        | Commands::Reconcile
        | Commands::Status => {}
    }
    Ok(())
}

fn spawn_printer(rx: Receiver<StatusEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            match event {
                StatusEvent::Info(message) => eprintln!("  {}", message),
                StatusEvent::Error(message) => eprintln!("! {}", message),
                StatusEvent::Disconnected { host } => eprintln!("! lost connection to {}", host),
                StatusEvent::InvalidateStructure => {}
            }
        }
    })
}
