pub use stratus_core::prelude::*;
