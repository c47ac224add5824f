//! Incremental per-session analytics.
//!
//! The accumulator keeps running maxima and an online mean/variance of
//! speed (Welford), so no frame history is retained. It is finalized
//! exactly once when the owning session closes.

use model::{SessionStats, TelemetrySample};

/// The session behind this accumulator has already been finalized.
/// Feeding it again is a programming error, never silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session accumulator already finalized")]
pub struct SessionClosed;

#[derive(Debug, Clone)]
pub struct SessionAccumulator {
    n: u64,
    mean_speed: f64,
    // sum of squared deviations from the running mean (Welford's M2)
    m2_speed: f64,
    top_speed: f32,
    max_rpm: f32,
    peak_g: f32,
    finalized: bool,
}

impl SessionAccumulator {
    pub fn new() -> Self {
        Self {
            n: 0,
            mean_speed: 0.0,
            m2_speed: 0.0,
            top_speed: 0.0,
            max_rpm: 0.0,
            peak_g: 0.0,
            finalized: false,
        }
    }

    pub fn samples(&self) -> u64 {
        self.n
    }

    pub fn update(&mut self, sample: &TelemetrySample) -> Result<(), SessionClosed> {
        if self.finalized {
            return Err(SessionClosed);
        }
        self.n += 1;
        let speed = sample.speed_mps as f64;
        let delta = speed - self.mean_speed;
        self.mean_speed += delta / self.n as f64;
        self.m2_speed += delta * (speed - self.mean_speed);

        self.top_speed = self.top_speed.max(sample.speed_mps);
        self.max_rpm = self.max_rpm.max(sample.rpm);
        let g = sample.g_force_x.hypot(sample.g_force_y);
        self.peak_g = self.peak_g.max(g);
        Ok(())
    }

    /// Produces the immutable stats record. Callable exactly once.
    pub fn finalize(&mut self) -> Result<SessionStats, SessionClosed> {
        if self.finalized {
            return Err(SessionClosed);
        }
        self.finalized = true;
        // population variance; matches a naive recompute over the frames
        let variance = if self.n > 0 {
            self.m2_speed / self.n as f64
        } else {
            0.0
        };
        Ok(SessionStats {
            samples: self.n,
            top_speed_mps: self.top_speed,
            mean_speed_mps: self.mean_speed as f32,
            speed_stddev_mps: variance.sqrt() as f32,
            max_rpm: self.max_rpm,
            peak_g: self.peak_g,
        })
    }
}

impl Default for SessionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
