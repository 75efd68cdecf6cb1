//! Checkpoint management for adjoint sensitivity analysis.
//!
//! During the forward pass a checkpoint is stored at the initial state and
//! after every `steps_between` accepted steps. During the backward pass the
//! forward solution inside one checkpoint interval is recomputed into a
//! [`DenseWindow`] and interpolated from there. Only one window is held at a
//! time; the backward pass visits intervals in reverse order so each is
//! recomputed once per sub-interval that touches it.

use crate::integrate::sensitivity::traits::Interpolation;

/// A stored forward state.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Time of the checkpoint.
    pub t: f64,
    /// State at time t.
    pub y: Vec<f64>,
    /// Step size the forward pass would have tried next.
    pub h: Option<f64>,
}

/// One recomputed forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct DensePoint {
    pub t: f64,
    pub y: Vec<f64>,
    pub f: Vec<f64>,
}

/// All recomputed steps of one checkpoint interval, in forward order.
#[derive(Debug, Clone)]
pub struct DenseWindow {
    index: usize,
    points: Vec<DensePoint>,
}

impl DenseWindow {
    pub fn new(index: usize, points: Vec<DensePoint>) -> Self {
        Self { index, points }
    }

    /// Interpolate the state at `t` into `out`. Times outside the window are
    /// clamped to its ends.
    pub fn interpolate(&self, t: f64, method: Interpolation, out: &mut [f64]) {
        let n = self.points.len();
        if n == 1 {
            out.copy_from_slice(&self.points[0].y);
            return;
        }
        let j = self.points.partition_point(|p| p.t <= t).clamp(1, n - 1) - 1;
        match method {
            Interpolation::Hermite => self.hermite(j, t, out),
            Interpolation::Polynomial => self.lagrange(j, t, out),
        }
    }

    fn hermite(&self, j: usize, t: f64, out: &mut [f64]) {
        let (p0, p1) = (&self.points[j], &self.points[j + 1]);
        let dt = p1.t - p0.t;
        let s = ((t - p0.t) / dt).clamp(0.0, 1.0);
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        for (i, o) in out.iter_mut().enumerate() {
            *o = h00 * p0.y[i] + h10 * dt * p0.f[i] + h01 * p1.y[i] + h11 * dt * p1.f[i];
        }
    }

    /// Cubic through the four stored points nearest to segment `j`.
    fn lagrange(&self, j: usize, t: f64, out: &mut [f64]) {
        let n = self.points.len();
        let hi = (j.saturating_sub(1) + 3).min(n - 1);
        let lo = hi.saturating_sub(3);
        let t = t.clamp(self.points[0].t, self.points[n - 1].t);
        out.iter_mut().for_each(|o| *o = 0.0);
        for a in lo..=hi {
            let mut basis = 1.0;
            for b in lo..=hi {
                if a != b {
                    basis *= (t - self.points[b].t) / (self.points[a].t - self.points[b].t);
                }
            }
            for (o, ya) in out.iter_mut().zip(&self.points[a].y) {
                *o += basis * ya;
            }
        }
    }
}

/// Stores forward checkpoints and the currently recomputed window.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// Stored checkpoints in forward time order.
    checkpoints: Vec<Checkpoint>,
    /// Accepted steps between checkpoints.
    steps_between: usize,
    steps_since: usize,
    /// Time reached by the forward pass.
    t_last: f64,
    window: Option<DenseWindow>,
}

impl CheckpointManager {
    /// Create a manager storing a checkpoint every `steps_between` accepted
    /// steps.
    pub fn new(steps_between: usize) -> Self {
        Self {
            checkpoints: Vec::new(),
            steps_between: steps_between.max(1),
            steps_since: 0,
            t_last: f64::NAN,
            window: None,
        }
    }

    /// Drop everything and start a forward pass at `(t0, y0)`.
    pub fn reset(&mut self, t0: f64, y0: &[f64]) {
        self.checkpoints.clear();
        self.checkpoints.push(Checkpoint {
            t: t0,
            y: y0.to_vec(),
            h: None,
        });
        self.steps_since = 0;
        self.t_last = t0;
        self.window = None;
    }

    /// Register an accepted forward step ending at `(t, y)`.
    pub fn record_step(&mut self, t: f64, y: &[f64], h_next: Option<f64>) {
        self.t_last = t;
        self.steps_since += 1;
        if self.steps_since >= self.steps_between {
            self.steps_since = 0;
            self.checkpoints.push(Checkpoint {
                t,
                y: y.to_vec(),
                h: h_next,
            });
        }
    }

    /// Get all stored checkpoints.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn get(&self, index: usize) -> Option<&Checkpoint> {
        self.checkpoints.get(index)
    }

    /// Get the number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Check if no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Time span covered by the forward pass.
    pub fn span(&self) -> Option<(f64, f64)> {
        self.checkpoints.first().map(|c| (c.t, self.t_last))
    }

    /// End of checkpoint interval `index`.
    pub fn interval_end(&self, index: usize) -> f64 {
        self.checkpoints
            .get(index + 1)
            .map(|c| c.t)
            .unwrap_or(self.t_last)
    }

    /// Checkpoint interval `k` with `t_k < t <= t_{k+1}`; the initial time
    /// maps to the first interval.
    pub fn find_interval(&self, t: f64) -> Option<usize> {
        let (t0, t_end) = self.span()?;
        if !(t >= t0 && t <= t_end) {
            return None;
        }
        Some(self.checkpoints.partition_point(|c| c.t < t).saturating_sub(1))
    }

    /// Recomputed window for interval `index`, if it is the loaded one.
    pub fn window(&self, index: usize) -> Option<&DenseWindow> {
        self.window.as_ref().filter(|w| w.index == index)
    }

    pub fn load_window(&mut self, window: DenseWindow) {
        self.window = Some(window);
    }
}
