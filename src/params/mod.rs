//! Parameter subset model.
//!
//! Problems declare their parameters as a [`ParamTree`] of named arrays. The
//! tree is flattened into a buffer through a [`ParamLayout`] offset table,
//! and split into a differentiable [`ParamSubset`] and its remainder. The
//! solvers own the buffer and expose it through [`ParamAccess`].
//!
//! ```
//! use stiffsens::params::{ParamLeaf, ParamSpace, ParamTree};
//!
//! let defaults = ParamTree::group()
//!     .with("k", 0.5)
//!     .with("volume", ParamLeaf::scalar(2.0).constant());
//! let space = ParamSpace::new(&defaults, None).unwrap();
//! let buffer = space.layout().make_buffer();
//! assert_eq!(space.subset().extract(&buffer).unwrap(), vec![0.5]);
//! assert_eq!(space.remainder().extract(&buffer).unwrap(), vec![2.0]);
//! ```

mod layout;
mod subset;
mod tree;

pub use layout::{ParamEntry, ParamLayout};
pub use subset::{ParamAccess, ParamSpace, ParamSubset};
pub use tree::{ParamLeaf, ParamTree};
