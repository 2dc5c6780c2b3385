//! Config tree: the per-block configuration sent to a device.
//!
//! ```text
//! {
//!   "M0":  { "elements": [ {"kind": "int", "ic": 0.1, "k": 10000}, null, ... ] },   // 8 slots
//!   "M1":  { "multipliers": [true, false, false, false] },
//!   "U":   { "outputs": [14, null, ...], "constant": 1.0 },                         // lane -> crossbar output
//!   "C":   { "elements": [0.5, null, ...], "upscaling": [false, ...] },             // lane -> stored coefficient
//!   "I":   { "outputs": [0, null, ...] },                                           // lane -> crossbar input
//!   "ADC": { "channels": [0, 8, null, ...] }                                        // channel -> crossbar output
//! }
//! ```
//!
//! Every lane-keyed array has exactly 32 entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::graph::{Circuit, M0Element, MAX_ADC_CHANNELS};
use super::types::{decode_coefficient, Route, NUM_LANES};
use super::validate::validate_circuit;
use crate::elements::{
    output_slot, Element, ElementKind, OutputSlot, TimeScale, NUM_M0_SLOTS, NUM_MULTIPLIERS,
};
use crate::error::{HybridError, Result};

/// Top-level entity blocks of the config tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Block {
    M0,
    M1,
    U,
    C,
    I,
    #[serde(rename = "ADC")]
    Adc,
}

impl Block {
    pub const ALL: [Block; 6] = [Block::M0, Block::M1, Block::U, Block::C, Block::I, Block::Adc];
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Block::M0 => "M0",
            Block::M1 => "M1",
            Block::U => "U",
            Block::C => "C",
            Block::I => "I",
            Block::Adc => "ADC",
        };
        f.write_str(name)
    }
}

impl FromStr for Block {
    type Err = HybridError;

    /// Accepts `M0` as well as path-style `/M0`.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim_start_matches('/');
        Block::ALL
            .into_iter()
            .find(|block| block.to_string().eq_ignore_ascii_case(name))
            .ok_or_else(|| HybridError::invalid_config(format!("unknown entity path '{s}'")))
    }
}

/// Occupant of an M0 slot on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum M0Entry {
    Int { ic: f64, k: u32 },
    Identity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct M0Config {
    pub elements: [Option<M0Entry>; NUM_M0_SLOTS],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct M1Config {
    pub multipliers: [bool; NUM_MULTIPLIERS],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UConfig {
    pub outputs: [Option<usize>; NUM_LANES],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CConfig {
    pub elements: [Option<f64>; NUM_LANES],
    pub upscaling: [bool; NUM_LANES],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IConfig {
    pub outputs: [Option<usize>; NUM_LANES],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdcConfig {
    pub channels: [Option<usize>; MAX_ADC_CHANNELS],
}

/// Nested per-block configuration of a circuit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigTree {
    #[serde(rename = "M0", default, skip_serializing_if = "Option::is_none")]
    pub m0: Option<M0Config>,
    #[serde(rename = "M1", default, skip_serializing_if = "Option::is_none")]
    pub m1: Option<M1Config>,
    #[serde(rename = "U", default, skip_serializing_if = "Option::is_none")]
    pub u: Option<UConfig>,
    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    pub c: Option<CConfig>,
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none")]
    pub i: Option<IConfig>,
    #[serde(rename = "ADC", default, skip_serializing_if = "Option::is_none")]
    pub adc: Option<AdcConfig>,
}

impl ConfigTree {
    /// Overlay the blocks present in `other`; blocks it leaves out keep
    /// their current configuration.
    pub fn merge(&mut self, other: ConfigTree) {
        if other.m0.is_some() {
            self.m0 = other.m0;
        }
        if other.m1.is_some() {
            self.m1 = other.m1;
        }
        if other.u.is_some() {
            self.u = other.u;
        }
        if other.c.is_some() {
            self.c = other.c;
        }
        if other.i.is_some() {
            self.i = other.i;
        }
        if other.adc.is_some() {
            self.adc = other.adc;
        }
    }

    /// Blocks carrying a configuration.
    pub fn blocks(&self) -> Vec<Block> {
        let present = [
            self.m0.is_some(),
            self.m1.is_some(),
            self.u.is_some(),
            self.c.is_some(),
            self.i.is_some(),
            self.adc.is_some(),
        ];
        Block::ALL
            .into_iter()
            .zip(present)
            .filter_map(|(block, present)| present.then_some(block))
            .collect()
    }
}

impl Circuit {
    /// Validate the circuit and lower it to a config tree, leaving out the
    /// blocks listed in `skip`.
    pub fn generate(&self, skip: &[Block]) -> Result<ConfigTree> {
        validate_circuit(self)?;
        let wanted = |block: Block| !skip.contains(&block);

        let mut tree = ConfigTree::default();

        if wanted(Block::M0) {
            let mut m0 = M0Config::default();
            for (id, entry) in m0.elements.iter_mut().enumerate() {
                *entry = self.m0(id).map(|element| match element {
                    M0Element::Integrator(config) => M0Entry::Int {
                        ic: config.ic,
                        k: config.time_scale.k0(),
                    },
                    M0Element::Identity => M0Entry::Identity,
                });
            }
            tree.m0 = Some(m0);
        }

        if wanted(Block::M1) {
            let mut m1 = M1Config::default();
            for (id, used) in m1.multipliers.iter_mut().enumerate() {
                *used = self.has_multiplier(id);
            }
            tree.m1 = Some(m1);
        }

        let mut u = UConfig {
            constant: self.constant_source().map(|c| c.value),
            ..UConfig::default()
        };
        let mut c = CConfig::default();
        let mut i = IConfig::default();
        for route in self.routes() {
            let Some(lane) = route.lane else { continue };
            let (stored, upscaled) = route.encoded();
            u.outputs[lane] = Some(route.uin);
            c.elements[lane] = Some(stored);
            c.upscaling[lane] = upscaled;
            i.outputs[lane] = Some(route.iout);
        }
        if wanted(Block::U) {
            tree.u = Some(u);
        }
        if wanted(Block::C) {
            tree.c = Some(c);
        }
        if wanted(Block::I) {
            tree.i = Some(i);
        }

        if wanted(Block::Adc) {
            let mut adc = AdcConfig::default();
            for (channel, element) in self.adc_channels().iter().enumerate() {
                adc.channels[channel] = element.output_lane();
            }
            tree.adc = Some(adc);
        }

        debug!(
            routes = self.routes().count(),
            skipped = skip.len(),
            "Generated config tree"
        );
        Ok(tree)
    }

    /// Rebuild a circuit from a config tree.
    ///
    /// Lane blocks U, C and I must be given together; a lane is in use when
    /// all three carry an entry for it.
    pub fn from_config(tree: &ConfigTree) -> Result<Circuit> {
        let mut circuit = Circuit::new();

        if let Some(m0) = &tree.m0 {
            for (id, entry) in m0.elements.iter().enumerate() {
                match entry {
                    Some(M0Entry::Int { ic, k }) => {
                        let time_scale = TimeScale::from_k0(*k).ok_or_else(|| {
                            HybridError::invalid_config(format!("unsupported k0 {k} for integrator {id}"))
                        })?;
                        let element = circuit.allocate(ElementKind::Integrator, Some(id))?;
                        circuit.set_ic(element, *ic)?;
                        circuit.set_time_scale(element, time_scale)?;
                    }
                    Some(M0Entry::Identity) => {
                        circuit.allocate(ElementKind::Identity, Some(id))?;
                    }
                    None => {}
                }
            }
        }

        if let Some(m1) = &tree.m1 {
            for (id, &used) in m1.multipliers.iter().enumerate() {
                if used {
                    circuit.allocate(ElementKind::Multiplier, Some(id))?;
                }
            }
        }

        match (&tree.u, &tree.c, &tree.i) {
            (Some(u), Some(c), Some(i)) => {
                if let Some(value) = u.constant {
                    circuit.set_constant_value(value);
                }
                for lane in 0..NUM_LANES {
                    match (u.outputs[lane], c.elements[lane], i.outputs[lane]) {
                        (Some(uin), Some(stored), Some(iout)) => {
                            if matches!(output_slot(uin)?, OutputSlot::Constant(_)) {
                                circuit.constant();
                            }
                            let coeff = decode_coefficient(stored, c.upscaling[lane]);
                            circuit.add(Route::new(uin, lane, coeff, iout))?;
                        }
                        (None, None, None) => {}
                        _ => {
                            return Err(HybridError::invalid_config(format!(
                                "lane {lane} is only partially configured"
                            )))
                        }
                    }
                }
            }
            (None, None, None) => {}
            _ => {
                return Err(HybridError::invalid_config(
                    "blocks U, C and I must be given together",
                ))
            }
        }

        if let Some(adc) = &tree.adc {
            for &uin in adc.channels.iter().flatten() {
                let element = match output_slot(uin)? {
                    OutputSlot::M0(id) => match circuit.m0(id) {
                        Some(M0Element::Identity) => Element::new(ElementKind::Identity, id)?,
                        _ => Element::new(ElementKind::Integrator, id)?,
                    },
                    OutputSlot::Multiplier(id) => Element::new(ElementKind::Multiplier, id)?,
                    OutputSlot::Constant(_) => {
                        return Err(HybridError::invalid_config("constant source cannot be measured"))
                    }
                };
                circuit.measure(element)?;
            }
        }

        Ok(circuit)
    }
}
