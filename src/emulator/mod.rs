//! Software stand-in for a hybrid computer.
//!
//! The emulator keeps the config tree a device would hold, answers the
//! same line-delimited JSON requests and runs the simulator in realtime
//! mode when asked to start a run. Each instance emulates one isolated
//! device; serve one instance per client connection.

mod protocol;

pub use protocol::{Envelope, Reply, Request, SetCircuit, StartRun};

use std::io::{BufRead, Write};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::circuit::{validate_circuit, Block, Circuit, ConfigTree, MAX_ADC_CHANNELS, NUM_LANES};
use crate::elements::{NUM_M0_SLOTS, NUM_MULTIPLIERS};
use crate::error::{HybridError, Result};
use crate::solver::{SolveOptions, Simulation};

/// Entity path of the emulated device.
pub const DEVICE_ENTITY: &str = "00-00-00-00-00-00";

/// Upper bound on the samples returned by a single run.
pub const MAX_SAMPLES: u64 = 100_000;

/// Request handler holding the state of one emulated device.
#[derive(Debug, Clone, Default)]
pub struct Emulator {
    config: ConfigTree,
    options: SolveOptions,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom integrator options for runs.
    pub fn with_options(options: SolveOptions) -> Self {
        Self {
            config: ConfigTree::default(),
            options,
        }
    }

    /// Configuration currently held by the device.
    pub fn config(&self) -> &ConfigTree {
        &self.config
    }

    /// Execute one request and return the reply payload.
    pub fn handle(&mut self, request: Request) -> Result<Value> {
        match request {
            Request::GetEntities => Ok(self.entities()),
            Request::ResetCircuit => {
                self.config = ConfigTree::default();
                Ok(json!({}))
            }
            Request::SetCircuit(set) => {
                if let Some(device) = set.entity.first() {
                    if device != DEVICE_ENTITY {
                        return Err(HybridError::UnknownEntity {
                            path: set.entity.join("/"),
                        });
                    }
                }
                debug!(entity = ?set.entity, blocks = ?set.config.blocks(), "Updating configuration");
                self.config.merge(set.config);
                Ok(json!({}))
            }
            Request::GetCircuit => Ok(serde_json::to_value(&self.config)?),
            Request::StartRun(run) => self.start_run(run),
        }
    }

    fn entities(&self) -> Value {
        let slots = |block: Block| match block {
            Block::M0 => NUM_M0_SLOTS,
            Block::M1 => NUM_MULTIPLIERS,
            Block::U | Block::C | Block::I => NUM_LANES,
            Block::Adc => MAX_ADC_CHANNELS,
        };
        let blocks: Map<String, Value> = Block::ALL
            .into_iter()
            .map(|block| (format!("/{block}"), json!({ "slots": slots(block) })))
            .collect();
        let mut device = Map::new();
        device.insert(DEVICE_ENTITY.to_string(), json!({ "/0": blocks }));
        Value::Object(device)
    }

    fn start_run(&self, run: StartRun) -> Result<Value> {
        if run.op_time == 0 || run.sample_rate == 0 {
            return Err(HybridError::invalid_param(
                "op_time and sample_rate must be positive",
            ));
        }
        let samples = u128::from(run.op_time) * u128::from(run.sample_rate) / 1_000_000_000;
        if samples > u128::from(MAX_SAMPLES) {
            return Err(HybridError::invalid_param(format!(
                "run would produce {samples} samples, at most {MAX_SAMPLES} are supported"
            )));
        }

        let circuit = Circuit::from_config(&self.config)?;
        for warning in validate_circuit(&circuit)? {
            debug!(%warning, "Starting run despite warning");
        }

        let t_final = run.op_time as f64 / 1e9;
        let times: Vec<f64> = (0..samples as u64)
            .map(|k| k as f64 / run.sample_rate as f64)
            .collect();

        info!(t_final, samples = times.len(), "Starting run");
        let simulation = Simulation::new(&circuit, true);
        let trajectory = simulation.solve_ivp(t_final, None, true, &self.options)?;
        let data = simulation.sample_adc(&trajectory, &times)?;
        let channels: Vec<usize> = circuit
            .adc_channels()
            .iter()
            .filter_map(|element| element.output_lane())
            .collect();

        Ok(json!({ "t": times, "data": data, "channels": channels }))
    }

    /// Answer a single wire line. Blank lines produce no reply.
    ///
    /// Failed requests, including malformed and unknown ones, are answered
    /// with an error reply and leave the device state untouched.
    pub fn handle_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let reply = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => {
                let (id, kind) = (envelope.id.clone(), envelope.kind.clone());
                match Request::try_from(envelope).and_then(|request| self.handle(request)) {
                    Ok(msg) => Reply::ok(id, kind, msg),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Request failed");
                        Reply::error(id, kind, &e)
                    }
                }
            }
            Err(e) => {
                let e = HybridError::from(e);
                warn!(error = %e, "Malformed request");
                Reply::error(None, "error", &e)
            }
        };

        Ok(Some(serde_json::to_string(&reply)?))
    }

    /// Serve requests from `reader` until end of input.
    pub fn serve<R: BufRead, W: Write>(&mut self, reader: R, mut writer: W) -> Result<()> {
        for line in reader.lines() {
            if let Some(reply) = self.handle_line(&line?)? {
                writeln!(writer, "{reply}")?;
                writer.flush()?;
            }
        }
        Ok(())
    }
}
