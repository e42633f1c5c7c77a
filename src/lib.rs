#![recursion_limit = "256"]

pub mod anchors;
pub mod boxes;
pub mod broadcast;
pub mod config;
pub mod debug;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod heads;
pub mod labels;
pub mod layers;
pub mod loss;
pub mod nms;
pub mod stats;
