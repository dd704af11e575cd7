pub mod backbone;
pub mod cond;
pub mod config;
pub mod data;
pub mod ema;
pub mod encoder;
pub mod error;
pub mod grid;
pub mod ldm;
pub mod logger;
pub mod mapping;
pub mod rng;
pub mod sampler;
pub mod training;
pub mod transformer;
pub mod weights;
