pub mod api;
pub mod config;
pub mod db;
pub mod detection;
pub mod error;
pub mod models;
pub mod onnx;
pub mod schema;

pub use error::{Error, Result};
