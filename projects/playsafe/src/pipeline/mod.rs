// Video analysis pipeline

pub mod crop;
pub mod detection;
pub mod finalize;
pub mod geometry;
pub mod orchestrator;
pub mod overlay;
pub mod pose;
pub mod risk;
pub mod tracking;
pub mod types;
