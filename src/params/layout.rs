//! Offset table mapping parameter paths onto a flat buffer.

use std::collections::HashSet;

use super::subset::ParamSubset;
use super::tree::{ParamLeaf, ParamTree};
use crate::integrate::error::{IntegrateError, IntegrateResult};

/// One leaf of the parameter structure and its place in the flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub path: String,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub len: usize,
    pub constant: bool,
}

impl ParamEntry {
    /// Whether `selector` names this leaf or one of its enclosing groups.
    fn selected_by(&self, selector: &str) -> bool {
        self.path == selector
            || (self.path.len() > selector.len()
                && self.path.starts_with(selector)
                && self.path.as_bytes()[selector.len()] == b'.')
    }
}

/// Flat layout of a [`ParamTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    defaults: Vec<f64>,
}

impl ParamLayout {
    /// Build the offset table. The values of `tree` become the defaults of
    /// freshly allocated buffers.
    pub fn new(tree: &ParamTree) -> IntegrateResult<Self> {
        let mut entries = Vec::new();
        let mut defaults = Vec::new();
        for (path, leaf) in tree.leaves() {
            if path.is_empty() || path.split('.').any(|part| part.is_empty()) {
                return Err(IntegrateError::InvalidInput {
                    context: format!("parameter path '{}' has an empty segment", path),
                });
            }
            let expected: usize = leaf.shape.iter().product();
            if expected != leaf.values.len() {
                return Err(IntegrateError::shape(path, expected, leaf.values.len()));
            }
            entries.push(ParamEntry {
                offset: defaults.len(),
                len: leaf.values.len(),
                shape: leaf.shape.clone(),
                constant: leaf.constant,
                path,
            });
            defaults.extend_from_slice(&leaf.values);
        }
        Ok(Self { entries, defaults })
    }

    /// Layout without any leaves.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            defaults: Vec::new(),
        }
    }

    /// Total number of flat values.
    pub fn len(&self) -> usize {
        self.defaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defaults.is_empty()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Entry of a leaf path.
    pub fn entry(&self, path: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// New buffer filled with the default values.
    pub fn make_buffer(&self) -> Vec<f64> {
        self.defaults.clone()
    }

    fn check_buffer(&self, buffer: &[f64]) -> IntegrateResult<()> {
        if buffer.len() != self.len() {
            return Err(IntegrateError::shape("parameter buffer", self.len(), buffer.len()));
        }
        Ok(())
    }

    /// Write the leaves of `values` into their offsets. Leaves not present in
    /// `values` keep their current buffer contents.
    pub fn update(&self, buffer: &mut [f64], values: &ParamTree) -> IntegrateResult<()> {
        self.check_buffer(buffer)?;
        let leaves = values.leaves();
        // Validate everything before touching the buffer.
        let mut targets = Vec::with_capacity(leaves.len());
        for (path, leaf) in &leaves {
            let entry = self
                .entry(path)
                .ok_or_else(|| IntegrateError::UnknownParameter { path: path.clone() })?;
            if leaf.values.len() != entry.len {
                return Err(IntegrateError::shape(path.clone(), entry.len, leaf.values.len()));
            }
            if !leaf.shape.is_empty() && leaf.shape != entry.shape && entry.len != 1 {
                return Err(IntegrateError::InvalidInput {
                    context: format!(
                        "parameter '{}' has shape {:?}, got {:?}",
                        path, entry.shape, leaf.shape
                    ),
                });
            }
            targets.push((entry, &leaf.values));
        }
        for (entry, src) in targets {
            buffer[entry.offset..entry.offset + entry.len].copy_from_slice(src);
        }
        Ok(())
    }

    /// Structured view of a buffer.
    pub fn extract(&self, buffer: &[f64]) -> IntegrateResult<ParamTree> {
        self.check_buffer(buffer)?;
        let mut tree = ParamTree::group();
        for entry in &self.entries {
            let leaf = ParamLeaf {
                values: buffer[entry.offset..entry.offset + entry.len].to_vec(),
                shape: entry.shape.clone(),
                constant: entry.constant,
            };
            tree.insert_path(&entry.path, leaf);
        }
        Ok(tree)
    }

    /// Split the leaves into a differentiable subset and its remainder.
    ///
    /// With `None` the subset is exactly the non-constant leaves. Selectors
    /// may name a leaf or a group (selecting all leaves below it). Both views
    /// keep layout order.
    pub fn partition(
        &self,
        subset_paths: Option<&[&str]>,
    ) -> IntegrateResult<(ParamSubset, ParamSubset)> {
        let selected: Vec<bool> = match subset_paths {
            None => self.entries.iter().map(|e| !e.constant).collect(),
            Some(selectors) => {
                let mut selected = vec![false; self.entries.len()];
                let mut seen = HashSet::new();
                for selector in selectors {
                    if !seen.insert(*selector) {
                        return Err(IntegrateError::DuplicateParameter {
                            path: selector.to_string(),
                        });
                    }
                    let mut matched = false;
                    for (i, entry) in self.entries.iter().enumerate() {
                        if entry.selected_by(selector) {
                            if selected[i] {
                                return Err(IntegrateError::DuplicateParameter {
                                    path: entry.path.clone(),
                                });
                            }
                            selected[i] = true;
                            matched = true;
                        }
                    }
                    if !matched {
                        return Err(IntegrateError::UnknownParameter {
                            path: selector.to_string(),
                        });
                    }
                }
                selected
            }
        };

        let pick = |want: bool| {
            let entries: Vec<&ParamEntry> = self
                .entries
                .iter()
                .zip(&selected)
                .filter(|(_, s)| **s == want)
                .map(|(e, _)| e)
                .collect();
            ParamSubset::new(&entries, self.len())
        };
        Ok((pick(true), pick(false)))
    }
}
