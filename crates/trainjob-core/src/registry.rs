//! Trainer profiles keyed by container image.

use crate::types::{Framework, Trainer, TrainerType};
use std::collections::HashMap;

/// Immutable lookup from image name (tag stripped) to trainer profile.
///
/// Built once from the built-in profiles plus configuration, then shared with
/// the resolvers. Unknown images resolve to the default torch profile.
#[derive(Debug, Clone)]
pub struct TrainerRegistry {
    profiles: HashMap<String, Trainer>,
    default: Trainer,
}

impl TrainerRegistry {
    /// Registry with no image profiles, only the default.
    #[must_use]
    pub fn empty() -> Self {
        Self { profiles: HashMap::new(), default: default_trainer() }
    }

    /// Registry with the profiles of the published runtime images.
    #[must_use]
    pub fn builtin() -> Self {
        Self::empty()
            .with_profile(
                "pytorch/pytorch",
                Trainer::new(TrainerType::CustomTrainer, Framework::Torch, "torchrun"),
            )
            .with_profile(
                "ghcr.io/kubeflow/trainer/mlx-runtime",
                Trainer::new(
                    TrainerType::CustomTrainer,
                    Framework::Mlx,
                    "mpirun --hostfile /etc/mpi/hostfile -x LD_LIBRARY_PATH=/usr/local/lib/ python3",
                ),
            )
            .with_profile(
                "ghcr.io/kubeflow/trainer/deepspeed-runtime",
                Trainer::new(
                    TrainerType::CustomTrainer,
                    Framework::Deepspeed,
                    "mpirun --hostfile /etc/mpi/hostfile python3",
                ),
            )
            .with_profile(
                "ghcr.io/kubeflow/trainer/torchtune-trainer",
                Trainer::new(TrainerType::BuiltinTrainer, Framework::Torchtune, "tune run"),
            )
    }

    /// Adds or replaces the profile for an image.
    #[must_use]
    pub fn with_profile(mut self, image: &str, trainer: Trainer) -> Self {
        self.profiles.insert(strip_tag(image).to_string(), trainer);
        self
    }

    /// Returns a fresh copy of the profile for an image.
    #[must_use]
    pub fn lookup(&self, image: &str) -> Trainer {
        self.profiles.get(strip_tag(image)).unwrap_or(&self.default).clone()
    }

    /// True if the image has a dedicated profile.
    #[must_use]
    pub fn contains(&self, image: &str) -> bool {
        self.profiles.contains_key(strip_tag(image))
    }
}

impl Default for TrainerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn default_trainer() -> Trainer {
    Trainer::new(TrainerType::CustomTrainer, Framework::Torch, "torchrun")
}

/// Removes the `:tag` and `@digest` suffixes from an image reference.
///
/// A `host:port` registry prefix is kept.
#[must_use]
pub fn strip_tag(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    let last_segment = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[last_segment..].find(':') {
        Some(colon) => &image[..last_segment + colon],
        None => image,
    }
}
