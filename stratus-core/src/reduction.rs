use crate::data_type::HasDataType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Reduction {
    Max,
    Min,
    Sum,
    Product,
    /// Partial results of a mean are sums. Dividing by the number of reduced elements
    /// is left to the caller.
    Mean,
}

impl Reduction {
    pub fn name(&self) -> &'static str {
        use Reduction::*;
        match self {
            Max => "max",
            Min => "min",
            Sum => "sum",
            Product => "prod",
            Mean => "mean",
        }
    }

    /// Neutral element: `combine(identity(), x) == x` for every `x`.
    pub fn identity<T: HasDataType>(&self) -> T {
        use Reduction::*;
        match self {
            Sum | Mean => T::zero(),
            Product => T::one(),
            Max => T::lowest(),
            Min => T::highest(),
        }
    }

    #[inline]
    pub fn combine<T: HasDataType>(&self, a: T, b: T) -> T {
        use Reduction::*;
        match self {
            Sum | Mean => a.add_elem(b),
            Product => a.mul_elem(b),
            Max => a.max_elem(b),
            Min => a.min_elem(b),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
