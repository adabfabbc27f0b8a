//! evolutron: convolutional networks for protein sequence analysis.
//!
//! The crate provides one-hot sequence encoders, readers for the common
//! protein dataset formats (FASTA, CSV, tab tables, CullPDB profile arrays),
//! a builder for multiscale dilated convolution networks with optional
//! bidirectional LSTM and locally connected stages, and a model wrapper that
//! trains, evaluates, saves and reloads those networks on candle.
pub mod building_blocks;
pub mod config;
pub mod error;
pub mod io;
pub mod models;
pub mod utils;

pub use error::EvolutronError;
pub use models::architecture::ArchitectureSpec;
pub use models::model_interface::ModelInterface;
pub use models::seqnet_model::SeqNetModel;
pub use utils::handle::Handle;
