//! Output buffers for solutions sampled at requested times, and their
//! conversions from and to numr tensors.

use numr::dtype::DType;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use crate::integrate::error::{IntegrateError, IntegrateResult};

/// Host copy of an `f64` tensor with `ndim` dimensions, row-major.
pub fn tensor_values(
    what: &str,
    tensor: &Tensor<CpuRuntime>,
    ndim: usize,
) -> IntegrateResult<Vec<f64>> {
    if tensor.dtype() != DType::F64 {
        return Err(IntegrateError::InvalidInput {
            context: format!("{} must be f64, got {:?}", what, tensor.dtype()),
        });
    }
    if tensor.shape().len() != ndim {
        return Err(IntegrateError::InvalidInput {
            context: format!("{} must have {} dimensions, got {:?}", what, ndim, tensor.shape()),
        });
    }
    Ok(tensor.contiguous().to_vec())
}

/// States at each requested time, row-major `[n_times, n_states]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    n_times: usize,
    n_states: usize,
    data: Vec<f64>,
}

impl Trajectory {
    /// Zero-filled buffer.
    pub fn zeros(n_times: usize, n_states: usize) -> Self {
        Self {
            n_times,
            n_states,
            data: vec![0.0; n_times * n_states],
        }
    }

    /// Wrap row-major data.
    pub fn from_vec(n_times: usize, n_states: usize, data: Vec<f64>) -> IntegrateResult<Self> {
        if data.len() != n_times * n_states {
            return Err(IntegrateError::shape("trajectory data", n_times * n_states, data.len()));
        }
        Ok(Self {
            n_times,
            n_states,
            data,
        })
    }

    /// Copy a `[n_times, n_states]` tensor.
    pub fn from_tensor(tensor: &Tensor<CpuRuntime>) -> IntegrateResult<Self> {
        let data = tensor_values("trajectory", tensor, 2)?;
        Self::from_vec(tensor.shape()[0], tensor.shape()[1], data)
    }

    pub fn n_times(&self) -> usize {
        self.n_times
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// State at time index `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_times`.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_states..(i + 1) * self.n_states]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.n_states..(i + 1) * self.n_states]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Copy into a `[n_times, n_states]` numr tensor.
    pub fn to_tensor(&self, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(&self.data, &[self.n_times, self.n_states], device)
    }
}

/// Sensitivities at each requested time, `[n_times, n_params, n_states]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityTrajectory {
    n_times: usize,
    n_params: usize,
    n_states: usize,
    data: Vec<f64>,
}

impl SensitivityTrajectory {
    pub fn zeros(n_times: usize, n_params: usize, n_states: usize) -> Self {
        Self {
            n_times,
            n_params,
            n_states,
            data: vec![0.0; n_times * n_params * n_states],
        }
    }

    pub fn n_times(&self) -> usize {
        self.n_times
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// All sensitivities at time index `i`, `block[j * n_states + k] = ∂y_k/∂p_j`.
    pub fn block(&self, i: usize) -> &[f64] {
        let size = self.n_params * self.n_states;
        &self.data[i * size..(i + 1) * size]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [f64] {
        let size = self.n_params * self.n_states;
        &mut self.data[i * size..(i + 1) * size]
    }

    /// `∂y_state/∂p_param` at time index `time`.
    pub fn get(&self, time: usize, param: usize, state: usize) -> f64 {
        self.block(time)[param * self.n_states + state]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Copy into a `[n_times, n_params, n_states]` numr tensor.
    pub fn to_tensor(&self, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(
            &self.data,
            &[self.n_times, self.n_params, self.n_states],
            device,
        )
    }
}
