pub mod bilstm;
pub mod building_blocks;
pub mod featurize;
pub mod graph;
