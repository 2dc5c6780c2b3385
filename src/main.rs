//! hybrid - Analog/hybrid computer circuit tool
//!
//! Simulates circuits stored as config trees, prints their crossbar
//! matrix, or emulates a device on stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! hybrid simulate circuit.json --t-final 2 --samples 200 > trace.csv
//! hybrid matrix circuit.json
//! hybrid emulate < requests.jsonl
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use hybrid_core::{
    circuit::{validate_circuit, ConfigTree},
    emulator::Emulator,
    error::{HybridError, Result},
    solver::{Method, SolveOptions},
    Circuit, Simulation,
};

/// Analog/hybrid computer circuit tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a circuit and print the sampled ADC channels as CSV
    Simulate {
        /// Path to the circuit config tree (.json)
        #[arg(value_name = "CIRCUIT_FILE")]
        circuit_file: PathBuf,

        /// Simulated time span
        #[arg(short, long, default_value_t = 1.0)]
        t_final: f64,

        /// Measure time in seconds instead of integrator time constants
        #[arg(long)]
        realtime: bool,

        /// Disable output saturation
        #[arg(long)]
        no_clip: bool,

        /// Integration method
        #[arg(short, long, value_enum, default_value_t = MethodArg::Dopri5)]
        method: MethodArg,

        /// Number of evenly spaced samples
        #[arg(short, long, default_value_t = 100)]
        samples: usize,

        /// Relative tolerance
        #[arg(long, default_value_t = 1e-6)]
        rtol: f64,

        /// Absolute tolerance
        #[arg(long, default_value_t = 1e-9)]
        atol: f64,
    },

    /// Print the 16x16 crossbar matrix of a circuit
    Matrix {
        /// Path to the circuit config tree (.json)
        #[arg(value_name = "CIRCUIT_FILE")]
        circuit_file: PathBuf,
    },

    /// Answer line-delimited JSON requests on stdin like a device
    Emulate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    /// Explicit Dormand-Prince 5(4)
    Dopri5,
    /// L-stable ESDIRK 4(3) for stiff circuits
    Esdirk43,
}

impl From<MethodArg> for Method {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Dopri5 => Method::Dopri5,
            MethodArg::Esdirk43 => Method::Esdirk43,
        }
    }
}

fn load_circuit(path: &Path) -> Result<Circuit> {
    let text = fs::read_to_string(path).map_err(|source| HybridError::FileReadError {
        path: path.display().to_string(),
        source,
    })?;
    let tree: ConfigTree = serde_json::from_str(&text)?;
    let circuit = Circuit::from_config(&tree)?;
    // Warnings are logged by the validator
    validate_circuit(&circuit)?;
    Ok(circuit)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Simulate {
            circuit_file,
            t_final,
            realtime,
            no_clip,
            method,
            samples,
            rtol,
            atol,
        } => {
            let circuit = load_circuit(&circuit_file)?;
            let simulation = Simulation::new(&circuit, realtime);
            let options = SolveOptions::default()
                .with_method(method.into())
                .with_tolerances(rtol, atol);
            let trajectory = simulation.solve_ivp(t_final, None, !no_clip, &options)?;

            let steps = samples.max(2) - 1;
            let times: Vec<f64> = (0..=steps)
                .map(|i| t_final * i as f64 / steps as f64)
                .collect();
            let rows = simulation.sample_adc(&trajectory, &times)?;

            let header: Vec<String> = simulation
                .adc_channels()
                .iter()
                .map(|element| element.to_string())
                .collect();
            println!("t,{}", header.join(","));
            for (t, row) in times.iter().zip(rows) {
                let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                println!("{t},{}", values.join(","));
            }
        }
        Command::Matrix { circuit_file } => {
            let circuit = load_circuit(&circuit_file)?;
            let matrix = circuit.to_dense_matrix();
            for row in matrix.row_iter() {
                let values: Vec<String> = row.iter().map(|v| format!("{v:>7.3}")).collect();
                println!("{}", values.join(" "));
            }
        }
        Command::Emulate => {
            let stdin = io::stdin();
            Emulator::new().serve(stdin.lock(), io::stdout())?;
        }
    }

    Ok(())
}
