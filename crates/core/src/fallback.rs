//! Device and model fallback chains.
//!
//! A [`FallbackChain`] is an ordered candidate list with a cursor that only
//! moves forward. [`FallbackPolicy`] pairs a model chain with a device chain
//! and is owned by a single request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;

/// Returned when a chain has no candidate left to advance to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fallback chain exhausted")
    }
}

impl std::error::Error for Exhausted {}

#[derive(Debug, Clone)]
pub struct FallbackChain<T> {
    candidates: Vec<T>,
    cursor: usize,
}

impl<T> FallbackChain<T> {
    pub fn new(candidates: Vec<T>) -> Result<Self, UpscaleError> {
        if candidates.is_empty() {
            return Err(UpscaleError::Configuration(
                "fallback chain needs at least one candidate".to_string(),
            ));
        }
        Ok(Self {
            candidates,
            cursor: 0,
        })
    }

    pub fn current(&self) -> &T {
        &self.candidates[self.cursor]
    }

    /// Moves to the next candidate. At the last candidate the cursor stays put.
    pub fn advance(&mut self) -> Result<&T, Exhausted> {
        if self.cursor + 1 >= self.candidates.len() {
            return Err(Exhausted);
        }
        self.cursor += 1;
        Ok(&self.candidates[self.cursor])
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[T] {
        &self.candidates
    }

    /// Rewinds to the first candidate. Only the policy uses this, when the
    /// model chain moves on and devices are retried from the top.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Compute device a model can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cuda(u32),
    Tensorrt(u32),
    Cpu,
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda(0) => f.write_str("cuda"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
            Self::Tensorrt(0) => f.write_str("tensorrt"),
            Self::Tensorrt(id) => write!(f, "tensorrt:{id}"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = UpscaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (kind, id) = match normalized.split_once(':') {
            Some((kind, id)) => {
                let id = id.parse::<u32>().map_err(|_| {
                    UpscaleError::Configuration(format!("invalid device id in '{s}'"))
                })?;
                (kind.to_string(), id)
            }
            None => (normalized, 0),
        };
        match kind.as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda(id)),
            "tensorrt" | "trt" => Ok(Self::Tensorrt(id)),
            "cpu" if id == 0 => Ok(Self::Cpu),
            _ => Err(UpscaleError::Configuration(format!("unknown device '{s}'"))),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = UpscaleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

/// Name of a model in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The active `(model, device)` pair. `generation` increases on every advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub model: ModelId,
    pub device: Device,
    pub generation: u64,
}

/// Request-scoped model and device fallback state.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    models: FallbackChain<ModelId>,
    devices: FallbackChain<Device>,
    generation: u64,
}

impl FallbackPolicy {
    pub fn new(models: Vec<ModelId>, devices: Vec<Device>) -> Result<Self, UpscaleError> {
        Ok(Self {
            models: FallbackChain::new(models)?,
            devices: FallbackChain::new(devices)?,
            generation: 0,
        })
    }

    pub fn current(&self) -> Candidate {
        Candidate {
            model: self.models.current().clone(),
            device: *self.devices.current(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next device for the current model; once devices run out, the next
    /// model on the first device.
    pub fn advance_device(&mut self) -> Result<Candidate, Exhausted> {
        if self.devices.advance().is_err() {
            return self.advance_model();
        }
        self.generation += 1;
        Ok(self.current())
    }

    /// Next model, restarting the device chain.
    pub fn advance_model(&mut self) -> Result<Candidate, Exhausted> {
        self.models.advance()?;
        self.devices.reset();
        self.generation += 1;
        Ok(self.current())
    }

    /// Upper bound on candidates a single tile can try.
    pub fn max_attempts(&self) -> usize {
        self.models.len() * self.devices.len()
    }

    /// `(model position, device position)`; strictly increases on every advance.
    pub fn position(&self) -> (usize, usize) {
        (self.models.position(), self.devices.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(models: &[&str], devices: &[Device]) -> FallbackPolicy {
        FallbackPolicy::new(
            models.iter().map(|m| ModelId::from(*m)).collect(),
            devices.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn chain_advances_then_exhausts_in_place() {
        let mut chain = FallbackChain::new(vec!['a', 'b', 'c']).unwrap();
        assert_eq!(*chain.current(), 'a');
        assert_eq!(chain.advance(), Ok(&'b'));
        assert_eq!(chain.advance(), Ok(&'c'));
        assert_eq!(chain.advance(), Err(Exhausted));
        assert_eq!(*chain.current(), 'c');
        assert_eq!(chain.position(), 2);
    }

    #[test]
    fn empty_chain_is_configuration_error() {
        let err = FallbackChain::<Device>::new(Vec::new()).unwrap_err();
        assert!(matches!(err, UpscaleError::Configuration(_)));
    }

    #[test]
    fn device_exhaustion_moves_to_next_model_on_first_device() {
        let mut policy = policy(&["primary", "alt"], &[Device::Cuda(0), Device::Cpu]);
        let c = policy.advance_device().unwrap();
        assert_eq!((c.model.as_str(), c.device), ("primary", Device::Cpu));
        let c = policy.advance_device().unwrap();
        assert_eq!((c.model.as_str(), c.device), ("alt", Device::Cuda(0)));
        policy.advance_device().unwrap();
        assert_eq!(policy.advance_device(), Err(Exhausted));
        assert_eq!(policy.current().model.as_str(), "alt");
        assert_eq!(policy.current().device, Device::Cpu);
    }

    #[test]
    fn model_advance_resets_devices() {
        let mut policy = policy(&["a", "b", "c"], &[Device::Tensorrt(0), Device::Cuda(0), Device::Cpu]);
        policy.advance_device().unwrap();
        let c = policy.advance_model().unwrap();
        assert_eq!((c.model.as_str(), c.device), ("b", Device::Tensorrt(0)));
        policy.advance_model().unwrap();
        assert_eq!(policy.advance_model(), Err(Exhausted));
    }

    #[test]
    fn positions_strictly_increase_and_are_bounded() {
        let mut policy = policy(&["a", "b", "c"], &[Device::Cuda(0), Device::Cuda(1), Device::Cpu]);
        let mut seen = vec![policy.position()];
        let mut step = 0;
        loop {
            let advanced = if step % 3 == 2 {
                policy.advance_model()
            } else {
                policy.advance_device()
            };
            if advanced.is_err() {
                break;
            }
            let position = policy.position();
            assert!(position > *seen.last().unwrap());
            seen.push(position);
            step += 1;
        }
        assert!(seen.len() <= policy.max_attempts());
        assert_eq!(policy.generation() as usize, seen.len() - 1);
    }

    #[test]
    fn device_parses_and_displays() {
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("trt".parse::<Device>().unwrap(), Device::Tensorrt(0));
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert!("npu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
        assert_eq!(Device::Tensorrt(0).to_string(), "tensorrt");
        assert!(Device::Cuda(0).is_accelerator());
        assert!(!Device::Cpu.is_accelerator());
    }

    #[test]
    fn device_round_trips_through_serde() {
        let json = serde_json::to_string(&vec![Device::Cuda(1), Device::Cpu]).unwrap();
        assert_eq!(json, r#"["cuda:1","cpu"]"#);
        let back: Vec<Device> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Device::Cuda(1), Device::Cpu]);
    }
}
