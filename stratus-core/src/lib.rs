mod block;
mod chunking;
mod data_type;
pub mod prelude;
mod reduction;
pub mod util;

pub use block::*;
pub use chunking::*;
pub use data_type::*;
pub use reduction::*;
