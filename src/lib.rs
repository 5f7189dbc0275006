#![allow(async_fn_in_trait)]
pub mod asset;
pub mod date_range;
pub mod download_plan;
pub mod element84;
pub mod error;
pub mod image_selection;
pub mod item;
pub mod merge;
pub mod pipeline;
pub mod planetary_computer;
pub mod product_search;
pub mod projection;
pub mod provider;
pub mod raster;
pub mod reproject;
pub mod search;
pub mod stac_operations;
pub mod transport;

pub use error::{Error, Result, SearchFailure, Stage, StageFailure};
