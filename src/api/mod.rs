//! User-facing array handles.
mod array;
mod context;

pub use self::array::*;
pub use self::context::*;
