//! Flat views onto part of a parameter buffer.

use std::ops::Range;

use super::layout::{ParamEntry, ParamLayout};
use super::tree::ParamTree;
use crate::integrate::error::{IntegrateError, IntegrateResult};

/// An ordered selection of leaves, viewed as one flat vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSubset {
    paths: Vec<String>,
    ranges: Vec<Range<usize>>,
    len: usize,
    buffer_len: usize,
}

impl ParamSubset {
    pub(crate) fn new(entries: &[&ParamEntry], buffer_len: usize) -> Self {
        let paths = entries.iter().map(|e| e.path.clone()).collect();
        let ranges: Vec<Range<usize>> = entries
            .iter()
            .map(|e| e.offset..e.offset + e.len)
            .collect();
        let len = ranges.iter().map(|r| r.len()).sum();
        Self {
            paths,
            ranges,
            len,
            buffer_len,
        }
    }

    /// Leaf paths in flat order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Number of flat values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer index of every flat value, in order.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }

    fn check(&self, buffer: &[f64], values_len: usize) -> IntegrateResult<()> {
        if buffer.len() != self.buffer_len {
            return Err(IntegrateError::shape("parameter buffer", self.buffer_len, buffer.len()));
        }
        if values_len != self.len {
            return Err(IntegrateError::shape("parameter subset", self.len, values_len));
        }
        Ok(())
    }

    /// Scatter `values` into the buffer.
    pub fn update(&self, buffer: &mut [f64], values: &[f64]) -> IntegrateResult<()> {
        self.check(buffer, values.len())?;
        for (idx, v) in self.offsets().zip(values) {
            buffer[idx] = *v;
        }
        Ok(())
    }

    /// Gather the selected values into `out`.
    pub fn extract_into(&self, buffer: &[f64], out: &mut [f64]) -> IntegrateResult<()> {
        self.check(buffer, out.len())?;
        for (idx, v) in self.offsets().zip(out.iter_mut()) {
            *v = buffer[idx];
        }
        Ok(())
    }

    /// Gather the selected values.
    pub fn extract(&self, buffer: &[f64]) -> IntegrateResult<Vec<f64>> {
        let mut out = vec![0.0; self.len];
        self.extract_into(buffer, &mut out)?;
        Ok(out)
    }
}

/// Parameter layout of a problem together with its differentiable subset and
/// the remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpace {
    layout: ParamLayout,
    subset: ParamSubset,
    remainder: ParamSubset,
}

impl ParamSpace {
    /// Build from default values. `subset_paths = None` differentiates with
    /// respect to all non-constant leaves.
    pub fn new(defaults: &ParamTree, subset_paths: Option<&[&str]>) -> IntegrateResult<Self> {
        let layout = ParamLayout::new(defaults)?;
        let (subset, remainder) = layout.partition(subset_paths)?;
        Ok(Self {
            layout,
            subset,
            remainder,
        })
    }

    /// Space without any parameters.
    pub fn empty() -> Self {
        let layout = ParamLayout::empty();
        let subset = ParamSubset::new(&[], 0);
        Self {
            layout,
            remainder: subset.clone(),
            subset,
        }
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Parameters that sensitivities and gradients are taken with respect to.
    pub fn subset(&self) -> &ParamSubset {
        &self.subset
    }

    pub fn remainder(&self) -> &ParamSubset {
        &self.remainder
    }
}

/// Parameter accessors shared by the solvers that own a parameter buffer.
pub trait ParamAccess {
    /// The parameter space and the mutable buffer it describes.
    fn param_parts(&mut self) -> (&ParamSpace, &mut [f64]);

    /// Read-only counterpart of [`param_parts`](Self::param_parts).
    fn param_view(&self) -> (&ParamSpace, &[f64]);

    /// Called after any parameter write.
    fn params_changed(&mut self) {}

    /// Write named values into the buffer.
    fn set_params(&mut self, values: &ParamTree) -> IntegrateResult<()> {
        let (space, buffer) = self.param_parts();
        space.layout().update(buffer, values)?;
        self.params_changed();
        Ok(())
    }

    /// Structured view of the current parameters.
    fn get_params(&self) -> IntegrateResult<ParamTree> {
        let (space, buffer) = self.param_view();
        space.layout().extract(buffer)
    }

    /// Write the differentiable subset from a flat vector.
    fn set_derivative_params(&mut self, values: &[f64]) -> IntegrateResult<()> {
        let (space, buffer) = self.param_parts();
        space.subset().update(buffer, values)?;
        self.params_changed();
        Ok(())
    }

    /// Write the remainder from a flat vector.
    fn set_remaining_params(&mut self, values: &[f64]) -> IntegrateResult<()> {
        let (space, buffer) = self.param_parts();
        space.remainder().update(buffer, values)?;
        self.params_changed();
        Ok(())
    }

    /// Current differentiable subset as a flat vector.
    fn derivative_params(&self) -> IntegrateResult<Vec<f64>> {
        let (space, buffer) = self.param_view();
        space.subset().extract(buffer)
    }

    /// Current remainder as a flat vector.
    fn remaining_params(&self) -> IntegrateResult<Vec<f64>> {
        let (space, buffer) = self.param_view();
        space.remainder().extract(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamLeaf;

    fn space() -> ParamSpace {
        let defaults = ParamTree::group()
            .with("k", vec![0.1, 0.2])
            .with("scale", ParamLeaf::scalar(3.0).constant())
            .with("y_ref", 1.5);
        ParamSpace::new(&defaults, None).unwrap()
    }

    #[test]
    fn test_update_extract_identity() {
        let space = space();
        let mut buffer = space.layout().make_buffer();
        let original = buffer.clone();

        let sub = space.subset().extract(&buffer).unwrap();
        assert_eq!(sub, vec![0.1, 0.2, 1.5]);
        space.subset().update(&mut buffer, &sub).unwrap();
        assert_eq!(buffer, original);

        let rem = space.remainder().extract(&buffer).unwrap();
        assert_eq!(rem, vec![3.0]);
        space.remainder().update(&mut buffer, &rem).unwrap();
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_subset_and_remainder_cover_buffer() {
        let space = space();
        let mut offsets: Vec<usize> = space
            .subset()
            .offsets()
            .chain(space.remainder().offsets())
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, (0..space.layout().len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_update_rejects_wrong_length() {
        let space = space();
        let mut buffer = space.layout().make_buffer();
        assert!(matches!(
            space.subset().update(&mut buffer, &[1.0]),
            Err(IntegrateError::ShapeMismatch { .. })
        ));
        assert!(space.remainder().extract(&buffer[..2]).is_err());
    }

    struct Holder {
        space: ParamSpace,
        buffer: Vec<f64>,
        changes: usize,
    }

    impl ParamAccess for Holder {
        fn param_parts(&mut self) -> (&ParamSpace, &mut [f64]) {
            (&self.space, &mut self.buffer)
        }
        fn param_view(&self) -> (&ParamSpace, &[f64]) {
            (&self.space, &self.buffer)
        }
        fn params_changed(&mut self) {
            self.changes += 1;
        }
    }

    #[test]
    fn test_param_access_round_trip() {
        let space = space();
        let buffer = space.layout().make_buffer();
        let mut holder = Holder {
            space,
            buffer,
            changes: 0,
        };
        holder.set_derivative_params(&[1.0, 2.0, 3.0]).unwrap();
        holder.set_remaining_params(&[4.0]).unwrap();
        assert_eq!(holder.buffer, vec![1.0, 2.0, 4.0, 3.0]);
        assert_eq!(holder.derivative_params().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(holder.remaining_params().unwrap(), vec![4.0]);

        let tree = holder.get_params().unwrap();
        assert_eq!(tree.leaf("scale").unwrap().values, vec![4.0]);
        holder
            .set_params(&ParamTree::group().with("y_ref", 9.0))
            .unwrap();
        assert_eq!(holder.derivative_params().unwrap(), vec![1.0, 2.0, 9.0]);
        assert_eq!(holder.changes, 3);
    }
}
