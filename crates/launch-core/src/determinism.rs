//! Seed selection and the reproducibility/throughput trade-off

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// Requested seed meaning "pick one for me"
pub const RANDOM_SEED: i64 = -1;

/// Inclusive range random seeds are drawn from
pub const RANDOM_SEED_RANGE: std::ops::RangeInclusive<u64> = 1..=4096;

/// Execution mode of accelerator libraries for a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeterminismMode {
    /// Algorithm auto-tuning on; numeric trajectory may vary run to run
    Benchmark,

    /// Auto-tuning off; bitwise reproducible given seed, config and hardware
    Deterministic,
}

/// The seed a run uses and the mode that goes with it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSelection {
    pub seed: u64,
    pub mode: DeterminismMode,
}

impl SeedSelection {
    /// Process-local RNG seeded from the selection
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    /// Environment variables a worker process needs to honor the selection
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("PYTHONHASHSEED", self.seed.to_string())];
        if self.mode == DeterminismMode::Deterministic {
            vars.push(("CUBLAS_WORKSPACE_CONFIG", ":4096:8".to_string()));
        }
        vars
    }
}

/// Select the run seed, drawing from the thread RNG for the sentinel
pub fn select_seed(requested: i64) -> Result<SeedSelection> {
    select_seed_with(requested, &mut rand::thread_rng())
}

/// Select the run seed, drawing from `rng` for the sentinel
pub fn select_seed_with<R: Rng>(requested: i64, rng: &mut R) -> Result<SeedSelection> {
    let selection = match requested {
        RANDOM_SEED => SeedSelection {
            seed: rng.gen_range(RANDOM_SEED_RANGE),
            mode: DeterminismMode::Benchmark,
        },
        seed if seed >= 0 => SeedSelection {
            seed: seed as u64,
            mode: DeterminismMode::Deterministic,
        },
        other => {
            return Err(Error::config(
                &["RUN.seed"],
                format!("seed {other} is invalid; use -1 for a random seed"),
            ))
        }
    };

    info!(
        requested,
        seed = selection.seed,
        mode = ?selection.mode,
        "Selected run seed"
    );
    Ok(selection)
}
