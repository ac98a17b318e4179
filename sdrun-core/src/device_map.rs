use std::{fmt, str::FromStr};

use crate::Error;

/// Where the pipeline's weights and tensors are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    /// Best available accelerator at this ordinal, CPU when none is.
    Ordinal(usize),
    Cuda(usize),
    Metal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let (backend, ordinal) = match lowered.split_once(':') {
            Some((backend, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidDevice(s.to_string()))?;
                (backend, Some(ordinal))
            }
            None => (lowered.as_str(), None),
        };
        match (backend, ordinal) {
            ("cpu", None) => Ok(Self::ForceCpu),
            ("auto", None) => Ok(Self::default()),
            ("gpu", ordinal) => Ok(Self::Ordinal(ordinal.unwrap_or(0))),
            ("cuda", ordinal) => Ok(Self::Cuda(ordinal.unwrap_or(0))),
            ("metal", ordinal) => Ok(Self::Metal(ordinal.unwrap_or(0))),
            _ => Err(Error::InvalidDevice(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}
