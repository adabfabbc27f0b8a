pub mod architecture;
pub mod builder;
pub mod model_interface;
pub mod seqnet_model;
