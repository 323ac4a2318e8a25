//! End-to-end depth-to-image pipeline

mod depth2img;

pub use depth2img::{Depth2ImgConfig, Depth2ImgPipeline};

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn_depth2img_samplers::{
    DdimConfig, DdimScheduler, DeisConfig, DeisMultistepScheduler, Scheduler,
};
use serde::{Deserialize, Serialize};

use crate::error::{Depth2ImgError, Result};

/// Scheduler algorithm selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// DEIS multistep - Exponential integrator (default)
    #[default]
    Deis,
    /// DDIM - Deterministic, fast
    Ddim,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 2] = [SchedulerKind::Deis, SchedulerKind::Ddim];

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::Deis => "deis",
            SchedulerKind::Ddim => "ddim",
        }
    }

    /// Build the scheduler with its Stable Diffusion 2 defaults
    pub fn build<B: Backend>(&self) -> Result<Box<dyn Scheduler<B>>> {
        let scheduler: Box<dyn Scheduler<B>> = match self {
            SchedulerKind::Deis => Box::new(DeisMultistepScheduler::<B>::new(DeisConfig::default())?),
            SchedulerKind::Ddim => Box::new(DdimScheduler::new(DdimConfig::default())),
        };
        Ok(scheduler)
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchedulerKind {
    type Err = Depth2ImgError;

    fn from_str(s: &str) -> Result<Self> {
        SchedulerKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Depth2ImgError::InvalidArgument(format!("unknown scheduler '{}'", s)))
    }
}
