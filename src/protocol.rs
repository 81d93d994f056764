//! Syringe-pump protocols.
//!
//! A protocol is an ordered list of [`ProtocolStep`]s. Each step moves the
//! valve to a port, then picks or dispenses a volume. When a Pick/Dispense
//! step completes, its title is due in the recording once the liquid has
//! crossed the tube to the sensor ([`transit_time_s`]).
//!
//! The pump command encoding is external; this module only validates
//! steps and tracks their completion through [`PumpClient`].

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub const PORT_RANGE: (u8, u8) = (1, 12);
/// µL
pub const VOLUME_RANGE: (f64, f64) = (3.0, 200.0);
/// µL/min
pub const SPEED_RANGE: (f64, f64) = (5.0, 8000.0);
/// ms
pub const MAX_WAIT_MS: u64 = 86_400_000;

/// Tube between valve and sensor.
const TUBE_DIAMETER_MM: f64 = 0.42;
const TUBE_LENGTH_MM: f64 = 200.0;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpAction {
    Pick,
    Dispense,
}

impl FromStr for PumpAction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pick" => Ok(Self::Pick),
            "Dispense" => Ok(Self::Dispense),
            other => Err(PipelineError::invalid(format!(
                "unknown pump action {other:?}, expected Pick or Dispense"
            ))),
        }
    }
}

impl fmt::Display for PumpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pick => write!(f, "Pick"),
            Self::Dispense => write!(f, "Dispense"),
        }
    }
}

/// One row of a protocol file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub port: u8,
    pub action: PumpAction,
    /// µL
    pub volume: f64,
    /// µL/min
    pub speed: f64,
    #[serde(default)]
    pub title: String,
    /// Pause after the step, ms. Empty cells read as 0.
    #[serde(default, deserialize_with = "empty_as_zero")]
    pub wait: u64,
}

impl ProtocolStep {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(PORT_RANGE.0..=PORT_RANGE.1).contains(&self.port) {
            return Err(PipelineError::invalid(format!(
                "port {} outside {}..={}",
                self.port, PORT_RANGE.0, PORT_RANGE.1
            )));
        }
        if !(VOLUME_RANGE.0..=VOLUME_RANGE.1).contains(&self.volume) {
            return Err(PipelineError::invalid(format!(
                "volume {} µL outside {}..={}",
                self.volume, VOLUME_RANGE.0, VOLUME_RANGE.1
            )));
        }
        if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&self.speed) {
            return Err(PipelineError::invalid(format!(
                "speed {} µL/min outside {}..={}",
                self.speed, SPEED_RANGE.0, SPEED_RANGE.1
            )));
        }
        if self.wait > MAX_WAIT_MS {
            return Err(PipelineError::invalid(format!(
                "wait {} ms exceeds {MAX_WAIT_MS}",
                self.wait
            )));
        }
        Ok(())
    }

    /// Seconds until this step's liquid reaches the sensor.
    pub fn transit_time_s(&self) -> f64 {
        transit_time_s(self.speed)
    }
}

fn empty_as_zero<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<u64> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or(0))
}

/// Time for liquid pushed at `speed` µL/min to cross the tube, in seconds.
///
/// The tube holds about 27.7 µL.
pub fn transit_time_s(speed: f64) -> f64 {
    let radius = TUBE_DIAMETER_MM / 2.0;
    let tube_volume = std::f64::consts::PI * radius * radius * TUBE_LENGTH_MM; // mm³ == µL
    tube_volume / speed * 60.0
}

/// Check every step, reporting the first bad one by row number.
pub fn validate_steps(steps: &[ProtocolStep]) -> PipelineResult<()> {
    for (i, step) in steps.iter().enumerate() {
        step.validate().map_err(|e| match e {
            PipelineError::InvalidConfiguration(msg) => {
                PipelineError::InvalidConfiguration(format!("step {}: {msg}", i + 1))
            }
            other => other,
        })?;
    }
    Ok(())
}

/// Load and validate a protocol CSV (`port,action,volume,speed,title,wait`).
pub fn load_protocol(path: &Path) -> Result<Vec<ProtocolStep>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening protocol {}", path.display()))?;
    read_protocol(file).with_context(|| format!("in protocol {}", path.display()))
}

pub fn read_protocol<R: std::io::Read>(reader: R) -> Result<Vec<ProtocolStep>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut steps = Vec::new();
    for (i, record) in rdr.deserialize::<ProtocolStep>().enumerate() {
        let step = record.with_context(|| format!("parsing row {}", i + 1))?;
        steps.push(step);
    }
    validate_steps(&steps)?;
    debug!("Loaded protocol with {} steps", steps.len());
    Ok(steps)
}

// ---------------------------------------------------------------------------
// Pump client
// ---------------------------------------------------------------------------

/// Anything that can run a protocol and report finished steps.
pub trait PumpClient {
    fn send(&mut self, steps: &[ProtocolStep]) -> Result<()>;

    /// Number of steps finished since the previous poll.
    fn poll_completed(&mut self) -> Result<usize>;
}

/// Tracks which step of a sent protocol is running.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRun {
    steps: Vec<ProtocolStep>,
    completed: usize,
}

impl ProtocolRun {
    pub fn new(steps: Vec<ProtocolStep>) -> Self {
        Self { steps, completed: 0 }
    }

    pub fn steps(&self) -> &[ProtocolStep] {
        &self.steps
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.steps.len()
    }

    /// Mark the next step as done and return it. `None` once every step
    /// has been reported.
    pub fn complete_next(&mut self) -> Option<&ProtocolStep> {
        let step = self.steps.get(self.completed)?;
        self.completed += 1;
        info!(
            "Protocol step {}/{} done: {} port {} ({})",
            self.completed,
            self.steps.len(),
            step.action,
            step.port,
            step.title
        );
        Some(step)
    }
}

/// In-memory pump for replays and tests: steps finish when told to.
#[derive(Debug, Default)]
pub struct ScriptedPump {
    sent: Vec<ProtocolStep>,
    pending: VecDeque<usize>,
}

impl ScriptedPump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `count` more finished steps on the next poll.
    pub fn finish(&mut self, count: usize) {
        self.pending.push_back(count);
    }

    pub fn sent(&self) -> &[ProtocolStep] {
        &self.sent
    }
}

impl PumpClient for ScriptedPump {
    fn send(&mut self, steps: &[ProtocolStep]) -> Result<()> {
        validate_steps(steps)?;
        self.sent = steps.to_vec();
        self.pending.clear();
        Ok(())
    }

    fn poll_completed(&mut self) -> Result<usize> {
        Ok(self.pending.pop_front().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn step(port: u8, volume: f64, speed: f64) -> ProtocolStep {
        ProtocolStep {
            port,
            action: PumpAction::Dispense,
            volume,
            speed,
            title: "PBS".into(),
            wait: 0,
        }
    }

    #[test]
    fn reads_protocol_csv() {
        let text = "port,action,volume,speed,title,wait\n\
                    6,Pick,100,1000,,\n\
                    7,Dispense,100,50,PBS,60000\n";
        let steps = read_protocol(text.as_bytes()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, PumpAction::Pick);
        assert_eq!(steps[0].wait, 0);
        assert_eq!(steps[1].title, "PBS");
        assert_eq!(steps[1].wait, 60_000);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(step(0, 50.0, 100.0).validate().is_err());
        assert!(step(13, 50.0, 100.0).validate().is_err());
        assert!(step(1, 2.0, 100.0).validate().is_err());
        assert!(step(1, 201.0, 100.0).validate().is_err());
        assert!(step(1, 50.0, 4.0).validate().is_err());
        assert!(step(1, 50.0, 8001.0).validate().is_err());
        assert!(step(12, 3.0, 8000.0).validate().is_ok());

        let mut long_wait = step(1, 50.0, 100.0);
        long_wait.wait = MAX_WAIT_MS + 1;
        assert!(long_wait.validate().is_err());
    }

    #[test]
    fn bad_row_names_the_step() {
        let text = "port,action,volume,speed,title,wait\n\
                    6,Pick,100,1000,,\n\
                    7,Dispense,500,50,PBS,\n";
        let err = read_protocol(text.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("step 2"));
        assert!(read_protocol("port,action,volume,speed,title,wait\n1,Flush,10,10,,\n".as_bytes()).is_err());
    }

    #[test]
    fn transit_time_matches_tube_volume() {
        // ~27.7 µL tube at 50 µL/min.
        assert_relative_eq!(transit_time_s(50.0), 33.25, epsilon = 0.01);
        assert_relative_eq!(transit_time_s(1000.0), transit_time_s(50.0) / 20.0);
    }

    #[test]
    fn run_reports_steps_in_order() {
        let mut run = ProtocolRun::new(vec![step(6, 100.0, 1000.0), step(7, 100.0, 50.0)]);
        assert_eq!(run.complete_next().map(|s| s.port), Some(6));
        assert_eq!(run.complete_next().map(|s| s.port), Some(7));
        assert!(run.is_finished());
        assert!(run.complete_next().is_none());
    }

    #[test]
    fn scripted_pump_reports_finished_steps_once() {
        let mut pump = ScriptedPump::new();
        pump.send(&[step(6, 100.0, 1000.0)]).unwrap();
        pump.finish(1);
        assert_eq!(pump.poll_completed().unwrap(), 1);
        assert_eq!(pump.poll_completed().unwrap(), 0);
        assert!(pump.send(&[step(20, 100.0, 1000.0)]).is_err());
    }
}
