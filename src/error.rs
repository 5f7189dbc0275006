use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::date_range::DateRange;
use crate::raster::RasterError;
use crate::search::SearchSession;
use crate::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error(transparent)]
    Search(#[from] Box<SearchFailure>),

    #[error("Search returned no items")]
    EmptySearch,

    #[error("No results met the quality threshold")]
    NoResults,

    #[error("Asset '{band}' not found on item {item_id}")]
    AssetNotFound { item_id: String, band: String },

    #[error("Failed to download asset '{band}' of item {item_id}")]
    Download {
        item_id: String,
        band: String,
        #[source]
        source: TransportError,
    },

    #[error("Geometry of {other:?} does not match {template:?}: {reason}")]
    GeometryMismatch {
        template: PathBuf,
        other: PathBuf,
        reason: String,
    },

    #[error("Unknown CRS: {0}")]
    UnknownCrs(String),

    #[error("Projection failed: {0}")]
    Projection(String),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A catalog query failed part way through a multi-range search.
///
/// Items gathered for the ranges searched before `range` are kept in
/// `partial`; the caller decides whether they are good enough.
#[derive(Error, Debug)]
#[error("Search failed for date range {range}")]
pub struct SearchFailure {
    pub range: DateRange,
    #[source]
    pub source: TransportError,
    pub partial: SearchSession,
}

impl SearchFailure {
    pub fn into_partial(self) -> SearchSession {
        self.partial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Search,
    Select,
    Download,
    Merge,
    Reproject,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Search => "search",
            Self::Select => "select",
            Self::Download => "download",
            Self::Merge => "merge",
            Self::Reproject => "reproject",
        };
        f.write_str(name)
    }
}

/// Failure of one pipeline stage for one item. Side effects of the stages
/// that completed before it are left on disk.
///
/// Search and select failures happen before there is an item; `item_id`
/// then holds the tile that was searched.
#[derive(Error, Debug)]
#[error("{item_id} failed at stage '{stage}'")]
pub struct StageFailure {
    pub item_id: String,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl StageFailure {
    pub fn new(item_id: &str, stage: Stage, source: impl Into<Error>) -> Self {
        Self {
            item_id: item_id.to_owned(),
            stage,
            source: source.into(),
        }
    }
}
