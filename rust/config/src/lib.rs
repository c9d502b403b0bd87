//! Configuration types shared between the launcher crates.

mod layout;
mod types;

pub use layout::*;
pub use types::*;
