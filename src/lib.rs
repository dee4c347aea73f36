pub mod adapter;
pub mod cli;
pub mod condition;
pub mod config;
pub mod depth;
pub mod error;
pub mod ldm;
pub mod model_kind;
pub mod output;
pub mod pipeline;
pub mod schedulers;
pub mod utils;

pub use error::Error;
