use log::{debug, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Band(String),
    Merged,
    Reprojected,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Band(band) => write!(f, "band '{band}'"),
            Self::Merged => f.write_str("merged"),
            Self::Reprojected => f.write_str("reprojected"),
        }
    }
}

/// A raster file on local disk belonging to one catalog item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub item_id: String,
    pub kind: AssetKind,
    pub path: PathBuf,
}

impl LocalAsset {
    /// `<dir>/<item_id>_<band>.<extension>`
    pub fn band(item_id: &str, band: &str, dir: &Path, extension: &str) -> Self {
        Self {
            item_id: item_id.to_owned(),
            kind: AssetKind::Band(band.to_owned()),
            path: dir.join(format!("{item_id}_{band}.{extension}")),
        }
    }

    /// `<dir>/<item_id>_merged.tif`
    pub fn merged(item_id: &str, dir: &Path) -> Self {
        Self {
            item_id: item_id.to_owned(),
            kind: AssetKind::Merged,
            path: dir.join(format!("{item_id}_merged.tif")),
        }
    }

    /// `<dir>/<item_id>_reprojected.tif`
    pub fn reprojected(item_id: &str, dir: &Path) -> Self {
        Self {
            item_id: item_id.to_owned(),
            kind: AssetKind::Reprojected,
            path: dir.join(format!("{item_id}_reprojected.tif")),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn band_name(&self) -> Option<&str> {
        match &self.kind {
            AssetKind::Band(band) => Some(band),
            _ => None,
        }
    }

    pub fn delete(&self) -> std::io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Removes assets whose content now lives elsewhere. Failures are logged
/// and otherwise ignored since the data is already safe in the output.
pub(crate) fn delete_consumed(assets: &[LocalAsset]) {
    for asset in assets {
        match asset.delete() {
            Ok(()) => debug!("Deleted {}", asset.path.display()),
            Err(e) => warn!("Could not delete {} asset {}: {e}", asset.kind, asset.path.display()),
        }
    }
}

/// `<output>.part`, where files are written before being renamed into place.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// File extension of an asset href, ignoring any query string.
pub(crate) fn href_extension(href: &str) -> &str {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "tif",
    }
}
