use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use photoshift_contracts::jobs::{ImageRef, TransformationJob};
use sha2::{Digest, Sha256};

const PLACEHOLDER_EDGE: u32 = 512;

/// Stands in for the provider when it is rate limited or unavailable.
///
/// The placeholder reference depends only on the job id, so simulating the
/// same job twice yields the same result.
#[derive(Debug)]
pub struct FallbackSimulator {
    base: String,
    simulations: AtomicU64,
}

impl FallbackSimulator {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            simulations: AtomicU64::new(0),
        }
    }

    pub fn simulate(&self, job: &TransformationJob) -> ImageRef {
        self.simulations.fetch_add(1, Ordering::SeqCst);
        ImageRef::new(format!(
            "{}/{}-{}.png",
            self.base,
            job.operation,
            placeholder_digest(job)
        ))
    }

    /// Number of `simulate` calls served so far.
    pub fn simulation_count(&self) -> u64 {
        self.simulations.load(Ordering::SeqCst)
    }

    /// Writes the placeholder for `job` as a solid PNG under `dir`.
    pub fn render_placeholder(&self, job: &TransformationJob, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!(
            "placeholder-{}-{}.png",
            job.operation,
            placeholder_digest(job)
        ));
        let (r, g, b) = color_from_job(job);
        let mut image = RgbImage::new(PLACEHOLDER_EDGE, PLACEHOLDER_EDGE);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(path)
    }
}

fn job_digest(job: &TransformationJob) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(job.id.as_str().as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn placeholder_digest(job: &TransformationJob) -> String {
    hex::encode(&job_digest(job)[..8])
}

fn color_from_job(job: &TransformationJob) -> (u8, u8, u8) {
    let digest = job_digest(job);
    (digest[8], digest[9], digest[10])
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use photoshift_contracts::jobs::{ImageRef, TransformationJob};
    use photoshift_contracts::operations::OperationKind;

    use super::FallbackSimulator;

    fn job() -> TransformationJob {
        TransformationJob::new(
            ImageRef::new("chair.png"),
            "on a beach",
            OperationKind::LifestyleContext,
            2,
            Utc::now(),
        )
    }

    #[test]
    fn simulate_is_idempotent_per_job() {
        let simulator = FallbackSimulator::new("placeholder://photoshift/");
        let job = job();
        let first = simulator.simulate(&job);
        let second = simulator.simulate(&job);
        assert_eq!(first, second);
        assert!(first
            .as_str()
            .starts_with("placeholder://photoshift/lifestyle-context-"));
        assert_eq!(simulator.simulation_count(), 2);
    }

    #[test]
    fn different_jobs_get_different_placeholders() {
        let simulator = FallbackSimulator::new("placeholder://photoshift");
        assert_ne!(simulator.simulate(&job()), simulator.simulate(&job()));
    }

    #[test]
    fn rendered_placeholder_is_a_stable_png() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let simulator = FallbackSimulator::new("placeholder://photoshift");
        let job = job();
        let path = simulator.render_placeholder(&job, &temp.path().join("out"))?;
        let again = simulator.render_placeholder(&job, &temp.path().join("out"))?;
        assert_eq!(path, again);

        let decoded = image::open(&path)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (512, 512));
        assert_eq!(decoded.get_pixel(0, 0), decoded.get_pixel(511, 511));
        assert_eq!(simulator.simulation_count(), 0);
        Ok(())
    }
}
