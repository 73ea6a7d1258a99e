//! Domain models: cells and rows, column mappings, configuration, state.

mod cell;
mod config;
mod mapping;
mod state;

pub use cell::*;
pub use config::*;
pub use mapping::*;
pub use state::*;
