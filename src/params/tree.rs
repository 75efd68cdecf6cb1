//! Nested, named parameter values.

use std::collections::BTreeMap;

use crate::integrate::error::{IntegrateError, IntegrateResult};

/// A named array of parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLeaf {
    /// Values in row-major order.
    pub values: Vec<f64>,
    /// Array shape; empty for scalars.
    pub shape: Vec<usize>,
    /// Constant leaves are excluded from the default differentiable subset.
    pub constant: bool,
}

impl ParamLeaf {
    /// Scalar parameter.
    pub fn scalar(value: f64) -> Self {
        Self {
            values: vec![value],
            shape: Vec::new(),
            constant: false,
        }
    }

    /// One-dimensional parameter.
    pub fn vector(values: Vec<f64>) -> Self {
        let len = values.len();
        Self {
            values,
            shape: vec![len],
            constant: false,
        }
    }

    /// Parameter with an explicit shape.
    pub fn array(values: Vec<f64>, shape: Vec<usize>) -> IntegrateResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(IntegrateError::shape("parameter array", expected, values.len()));
        }
        Ok(Self {
            values,
            shape,
            constant: false,
        })
    }

    /// Mark this leaf as constant.
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    /// Number of flat values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for zero-sized arrays.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Tree of parameter groups and leaves addressed by dotted paths.
///
/// Groups keep their children sorted by name, so flattening a tree always
/// yields the same order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamTree {
    Leaf(ParamLeaf),
    Group(BTreeMap<String, ParamTree>),
}

impl Default for ParamTree {
    fn default() -> Self {
        Self::group()
    }
}

impl ParamTree {
    /// Empty group.
    pub fn group() -> Self {
        Self::Group(BTreeMap::new())
    }

    /// Builder-style insert of a child into a group.
    ///
    /// Inserting into a leaf replaces the leaf with a group.
    pub fn with(mut self, name: &str, child: impl Into<ParamTree>) -> Self {
        self.insert(name, child);
        self
    }

    /// Insert a child into a group.
    pub fn insert(&mut self, name: &str, child: impl Into<ParamTree>) {
        if let Self::Leaf(_) = self {
            *self = Self::group();
        }
        if let Self::Group(children) = self {
            children.insert(name.to_string(), child.into());
        }
    }

    /// Look up a subtree by dotted path.
    pub fn get(&self, path: &str) -> Option<&ParamTree> {
        path.split('.').try_fold(self, |node, part| match node {
            Self::Group(children) => children.get(part),
            Self::Leaf(_) => None,
        })
    }

    /// Look up a leaf by dotted path.
    pub fn leaf(&self, path: &str) -> Option<&ParamLeaf> {
        match self.get(path)? {
            Self::Leaf(leaf) => Some(leaf),
            Self::Group(_) => None,
        }
    }

    /// All leaves with their dotted paths, in sorted order.
    pub fn leaves(&self) -> Vec<(String, &ParamLeaf)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a ParamLeaf)>) {
        match self {
            Self::Leaf(leaf) => out.push((prefix, leaf)),
            Self::Group(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", prefix, name)
                    };
                    child.collect_leaves(path, out);
                }
            }
        }
    }

    /// Insert a leaf at a dotted path, creating intermediate groups.
    pub(crate) fn insert_path(&mut self, path: &str, leaf: ParamLeaf) {
        match path.split_once('.') {
            None => self.insert(path, leaf),
            Some((head, rest)) => {
                if let Self::Leaf(_) = self {
                    *self = Self::group();
                }
                if let Self::Group(children) = self {
                    children
                        .entry(head.to_string())
                        .or_insert_with(Self::group)
                        .insert_path(rest, leaf);
                }
            }
        }
    }
}

impl From<ParamLeaf> for ParamTree {
    fn from(leaf: ParamLeaf) -> Self {
        Self::Leaf(leaf)
    }
}

impl From<f64> for ParamTree {
    fn from(value: f64) -> Self {
        Self::Leaf(ParamLeaf::scalar(value))
    }
}

impl From<Vec<f64>> for ParamTree {
    fn from(values: Vec<f64>) -> Self {
        Self::Leaf(ParamLeaf::vector(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaves_are_sorted_dotted_paths() {
        let tree = ParamTree::group()
            .with("k", 0.5)
            .with("b", ParamTree::group().with("y", vec![1.0, 2.0]).with("x", 3.0));
        let paths: Vec<String> = tree.leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["b.x", "b.y", "k"]);
        assert_eq!(tree.leaf("b.y").unwrap().values, vec![1.0, 2.0]);
        assert!(tree.leaf("b").is_none());
        assert!(tree.get("b.z").is_none());
    }

    #[test]
    fn test_array_shape_checked() {
        assert!(ParamLeaf::array(vec![1.0; 6], vec![2, 3]).is_ok());
        assert!(ParamLeaf::array(vec![1.0; 5], vec![2, 3]).is_err());
    }

    #[test]
    fn test_insert_path_creates_groups() {
        let mut tree = ParamTree::group();
        tree.insert_path("a.b.c", ParamLeaf::scalar(1.0));
        assert_eq!(tree.leaf("a.b.c").unwrap().values, vec![1.0]);
    }
}
