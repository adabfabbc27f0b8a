pub mod data_handling;
pub mod handle;
pub mod literal;
pub mod logging;
pub mod stats;
pub mod utils;
