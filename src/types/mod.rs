//! Common types used throughout stratus.
mod config;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

pub use stratus_core::*;

pub use self::config::*;

/// Identifies a node of an operation graph or of an execution plan.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Name of the store array this node materializes to.
    pub fn array_name(&self) -> String {
        format!("array-{:03}", self.0)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId").field(&self.0).finish()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}
