//! Differentiable values a right-hand side is written against.
//!
//! [`OdeProblem::rhs_ad`](super::OdeProblem::rhs_ad) is generic over
//! [`AdTensor`], so a single definition of `f(t, y, p)` is evaluated as
//! plain values, pushed through forward mode with [`DualTensor`] and pulled
//! back through reverse mode with [`Var`].

use numr::autograd::dual_ops::{
    dual_add, dual_add_scalar, dual_cos, dual_div, dual_exp, dual_log, dual_mul, dual_mul_scalar,
    dual_narrow, dual_neg, dual_pow_scalar, dual_sin, dual_sqrt, dual_square, dual_sub,
    dual_tanh,
};
use numr::autograd::{
    var_add, var_add_scalar, var_cos, var_div, var_exp, var_log, var_mul, var_mul_scalar,
    var_neg, var_pow_scalar, var_sin, var_sqrt, var_square, var_sub, var_sum, var_tanh,
    DualTensor, Var,
};
use numr::dtype::DType;
use numr::error::Result;
use numr::ops::ShapeOps;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::runtime::RuntimeClient;
use numr::tensor::Tensor;

/// One-dimensional value that carries derivative information.
///
/// Binary operations broadcast a length-1 operand against a vector.
pub trait AdTensor: Sized + Clone {
    /// Wrap values that carry no derivative.
    fn from_values(values: &[f64], client: &CpuClient) -> Self;

    /// Underlying values.
    fn value(&self) -> &Tensor<CpuRuntime>;

    /// Component `i` as a length-1 value.
    fn at(&self, i: usize, client: &CpuClient) -> Result<Self>;

    /// Concatenate length-1 values into a vector.
    fn stack(parts: &[Self], client: &CpuClient) -> Result<Self>;

    fn add(&self, other: &Self, client: &CpuClient) -> Result<Self>;
    fn sub(&self, other: &Self, client: &CpuClient) -> Result<Self>;
    fn mul(&self, other: &Self, client: &CpuClient) -> Result<Self>;
    fn div(&self, other: &Self, client: &CpuClient) -> Result<Self>;
    fn neg(&self, client: &CpuClient) -> Result<Self>;
    fn add_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self>;
    fn mul_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self>;
    fn powf(&self, exponent: f64, client: &CpuClient) -> Result<Self>;
    fn exp(&self, client: &CpuClient) -> Result<Self>;
    fn ln(&self, client: &CpuClient) -> Result<Self>;
    fn sqrt(&self, client: &CpuClient) -> Result<Self>;
    fn square(&self, client: &CpuClient) -> Result<Self>;
    fn sin(&self, client: &CpuClient) -> Result<Self>;
    fn cos(&self, client: &CpuClient) -> Result<Self>;
    fn tanh(&self, client: &CpuClient) -> Result<Self>;

    /// Scalar constant as a length-1 value.
    fn scalar(value: f64, client: &CpuClient) -> Self {
        Self::from_values(&[value], client)
    }
}

fn basis(n: usize, i: usize, client: &CpuClient) -> Tensor<CpuRuntime> {
    let mut data = vec![0.0; n];
    data[i] = 1.0;
    Tensor::<CpuRuntime>::from_slice(&data, &[n], client.device())
}

impl AdTensor for DualTensor<CpuRuntime> {
    fn from_values(values: &[f64], client: &CpuClient) -> Self {
        DualTensor::constant(Tensor::<CpuRuntime>::from_slice(
            values,
            &[values.len()],
            client.device(),
        ))
    }

    fn value(&self) -> &Tensor<CpuRuntime> {
        self.primal()
    }

    fn at(&self, i: usize, _client: &CpuClient) -> Result<Self> {
        dual_narrow(self, 0, i, 1)
    }

    fn stack(parts: &[Self], client: &CpuClient) -> Result<Self> {
        let primals: Vec<&Tensor<CpuRuntime>> = parts.iter().map(|p| p.primal()).collect();
        let primal = client.cat(&primals, 0)?;
        if parts.iter().all(|p| p.tangent().is_none()) {
            return Ok(DualTensor::constant(primal));
        }
        // Constant parts contribute zero tangents.
        let tangents: Vec<Tensor<CpuRuntime>> = parts
            .iter()
            .map(|p| match p.tangent() {
                Some(t) => t.clone(),
                None => Tensor::zeros(p.primal().shape(), DType::F64, client.device()),
            })
            .collect();
        let refs: Vec<&Tensor<CpuRuntime>> = tangents.iter().collect();
        Ok(DualTensor::with_tangent(primal, client.cat(&refs, 0)?))
    }

    fn add(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        dual_add(self, other, client)
    }

    fn sub(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        dual_sub(self, other, client)
    }

    fn mul(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        dual_mul(self, other, client)
    }

    fn div(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        dual_div(self, other, client)
    }

    fn neg(&self, client: &CpuClient) -> Result<Self> {
        dual_neg(self, client)
    }

    fn add_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self> {
        dual_add_scalar(self, scalar, client)
    }

    fn mul_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self> {
        dual_mul_scalar(self, scalar, client)
    }

    fn powf(&self, exponent: f64, client: &CpuClient) -> Result<Self> {
        dual_pow_scalar(self, exponent, client)
    }

    fn exp(&self, client: &CpuClient) -> Result<Self> {
        dual_exp(self, client)
    }

    fn ln(&self, client: &CpuClient) -> Result<Self> {
        dual_log(self, client)
    }

    fn sqrt(&self, client: &CpuClient) -> Result<Self> {
        dual_sqrt(self, client)
    }

    fn square(&self, client: &CpuClient) -> Result<Self> {
        dual_square(self, client)
    }

    fn sin(&self, client: &CpuClient) -> Result<Self> {
        dual_sin(self, client)
    }

    fn cos(&self, client: &CpuClient) -> Result<Self> {
        dual_cos(self, client)
    }

    fn tanh(&self, client: &CpuClient) -> Result<Self> {
        dual_tanh(self, client)
    }
}

impl AdTensor for Var<CpuRuntime> {
    fn from_values(values: &[f64], client: &CpuClient) -> Self {
        Var::new(
            Tensor::<CpuRuntime>::from_slice(values, &[values.len()], client.device()),
            false,
        )
    }

    fn value(&self) -> &Tensor<CpuRuntime> {
        self.tensor()
    }

    fn at(&self, i: usize, client: &CpuClient) -> Result<Self> {
        // No narrowing op records a backward, so select with a basis vector.
        let e = Var::new(basis(self.numel(), i, client), false);
        var_sum(&var_mul(self, &e, client)?, &[0], true, client)
    }

    fn stack(parts: &[Self], client: &CpuClient) -> Result<Self> {
        let n = parts.len();
        let mut acc = Var::new(Tensor::zeros(&[n], DType::F64, client.device()), false);
        for (i, part) in parts.iter().enumerate() {
            let e = Var::new(basis(n, i, client), false);
            acc = var_add(&acc, &var_mul(part, &e, client)?, client)?;
        }
        Ok(acc)
    }

    fn add(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        var_add(self, other, client)
    }

    fn sub(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        var_sub(self, other, client)
    }

    fn mul(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        var_mul(self, other, client)
    }

    fn div(&self, other: &Self, client: &CpuClient) -> Result<Self> {
        var_div(self, other, client)
    }

    fn neg(&self, client: &CpuClient) -> Result<Self> {
        var_neg(self, client)
    }

    fn add_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self> {
        var_add_scalar(self, scalar, client)
    }

    fn mul_scalar(&self, scalar: f64, client: &CpuClient) -> Result<Self> {
        var_mul_scalar(self, scalar, client)
    }

    fn powf(&self, exponent: f64, client: &CpuClient) -> Result<Self> {
        var_pow_scalar(self, exponent, client)
    }

    fn exp(&self, client: &CpuClient) -> Result<Self> {
        var_exp(self, client)
    }

    fn ln(&self, client: &CpuClient) -> Result<Self> {
        var_log(self, client)
    }

    fn sqrt(&self, client: &CpuClient) -> Result<Self> {
        var_sqrt(self, client)
    }

    fn square(&self, client: &CpuClient) -> Result<Self> {
        var_square(self, client)
    }

    fn sin(&self, client: &CpuClient) -> Result<Self> {
        var_sin(self, client)
    }

    fn cos(&self, client: &CpuClient) -> Result<Self> {
        var_cos(self, client)
    }

    fn tanh(&self, client: &CpuClient) -> Result<Self> {
        var_tanh(self, client)
    }
}
