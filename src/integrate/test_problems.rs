//! Small problems with closed-form solutions shared by the solver tests.

use numr::runtime::cpu::CpuClient;

use crate::integrate::error::{IntegrateError, IntegrateResult};
use crate::integrate::traits::{AdTensor, OdeProblem};
use crate::params::{ParamLeaf, ParamSpace, ParamTree};

/// `y' = -k y`. Every callback comes from the autograd defaults.
pub(crate) struct Decay {
    params: ParamSpace,
}

impl Decay {
    pub fn new(k: f64) -> Self {
        let defaults = ParamTree::group().with("k", k);
        Self {
            params: ParamSpace::new(&defaults, None).unwrap(),
        }
    }
}

impl OdeProblem for Decay {
    fn n_states(&self) -> usize {
        1
    }

    fn params(&self) -> &ParamSpace {
        &self.params
    }

    fn rhs_ad<T: AdTensor>(
        &self,
        _t: f64,
        y: &T,
        p: &T,
        client: &CpuClient,
    ) -> numr::error::Result<T> {
        p.at(0, client)?.neg(client)?.mul(y, client)
    }
}

/// Linear decay chain
///
/// ```text
/// y0' = -a y0
/// y1' =  a y0 - b y1 + forcing
/// ```
///
/// with `forcing` a constant leaf. The right-hand side and state Jacobian
/// are hand-written; parameter derivatives come from autograd.
pub(crate) struct Chain {
    params: ParamSpace,
    a: usize,
    b: usize,
    forcing: usize,
}

impl Chain {
    pub fn new(a: f64, b: f64, subset: Option<&[&str]>) -> Self {
        let defaults = ParamTree::group()
            .with("rates", ParamTree::group().with("a", a).with("b", b))
            .with("forcing", ParamLeaf::scalar(0.0).constant());
        let params = ParamSpace::new(&defaults, subset).unwrap();
        let offset = |path: &str| params.layout().entry(path).unwrap().offset;
        let (a, b, forcing) = (offset("rates.a"), offset("rates.b"), offset("forcing"));
        Self {
            params,
            a,
            b,
            forcing,
        }
    }

    /// Closed-form `(y, ∂y/∂a, ∂y/∂b)` at `t` for zero forcing.
    pub fn exact(a: f64, b: f64, y0: [f64; 2], t: f64) -> ([f64; 2], [f64; 2], [f64; 2]) {
        let ea = (-a * t).exp();
        let eb = (-b * t).exp();
        let u = ea - eb;
        let d = b - a;
        let y = [y0[0] * ea, y0[1] * eb + a * y0[0] * u / d];
        let dy_da = [
            -t * y0[0] * ea,
            y0[0] * (u / d - a * t * ea / d + a * u / (d * d)),
        ];
        let dy_db = [
            0.0,
            -t * y0[1] * eb + a * y0[0] * (t * eb / d - u / (d * d)),
        ];
        (y, dy_da, dy_db)
    }
}

impl OdeProblem for Chain {
    fn n_states(&self) -> usize {
        2
    }

    fn params(&self) -> &ParamSpace {
        &self.params
    }

    fn rhs_ad<T: AdTensor>(
        &self,
        _t: f64,
        y: &T,
        p: &T,
        client: &CpuClient,
    ) -> numr::error::Result<T> {
        let (a, b) = (p.at(self.a, client)?, p.at(self.b, client)?);
        let (y0, y1) = (y.at(0, client)?, y.at(1, client)?);
        let decay = a.mul(&y0, client)?;
        let f1 = decay
            .sub(&b.mul(&y1, client)?, client)?
            .add(&p.at(self.forcing, client)?, client)?;
        T::stack(&[decay.neg(client)?, f1], client)
    }

    fn rhs(&self, _t: f64, y: &[f64], ydot: &mut [f64], p: &[f64]) -> IntegrateResult<()> {
        let (a, b) = (p[self.a], p[self.b]);
        ydot[0] = -a * y[0];
        ydot[1] = a * y[0] - b * y[1] + p[self.forcing];
        Ok(())
    }

    fn jac(&self, _t: f64, _y: &[f64], jac: &mut [f64], p: &[f64]) -> IntegrateResult<()> {
        let (a, b) = (p[self.a], p[self.b]);
        jac.copy_from_slice(&[-a, 0.0, a, -b]);
        Ok(())
    }
}

/// [`Decay`] whose right-hand side fails past `t_fail`.
pub(crate) struct FailAfter {
    inner: Decay,
    t_fail: f64,
}

impl FailAfter {
    pub fn new(k: f64, t_fail: f64) -> Self {
        Self {
            inner: Decay::new(k),
            t_fail,
        }
    }
}

impl OdeProblem for FailAfter {
    fn n_states(&self) -> usize {
        1
    }

    fn params(&self) -> &ParamSpace {
        self.inner.params()
    }

    fn rhs_ad<T: AdTensor>(
        &self,
        t: f64,
        y: &T,
        p: &T,
        client: &CpuClient,
    ) -> numr::error::Result<T> {
        self.inner.rhs_ad(t, y, p, client)
    }

    fn rhs(&self, t: f64, y: &[f64], ydot: &mut [f64], p: &[f64]) -> IntegrateResult<()> {
        if t > self.t_fail {
            return Err(IntegrateError::InvalidInput {
                context: format!("rhs undefined at t = {}", t),
            });
        }
        self.inner.rhs(t, y, ydot, p)
    }
}
