//! Per-item processing: download, merge, reproject.
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::asset::LocalAsset;
use crate::download_plan::AssetDownloader;
use crate::error::{Stage, StageFailure};
use crate::item::CatalogItem;
use crate::merge::merge;
use crate::projection::{Crs, CrsSpec};
use crate::raster::RasterInfo;
use crate::reproject::reproject;
use crate::transport::Transport;

/// Where an item is in its pipeline. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemState {
    Searched,
    Selected,
    Downloaded,
    Merged,
    Reprojected,
    Done,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Searched => "SEARCHED",
            Self::Selected => "SELECTED",
            Self::Downloaded => "DOWNLOADED",
            Self::Merged => "MERGED",
            Self::Reprojected => "REPROJECTED",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Asset keys to download, in output band order.
    pub bands: Vec<String>,
    pub destination_dir: PathBuf,
    /// Reprojection is skipped when unset.
    pub target_crs: Option<CrsSpec>,
    /// Delete downloads once merged and the merged file once reprojected.
    pub delete_intermediate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedItem {
    pub item_id: String,
    pub state: ItemState,
    /// The final product: reprojected, or merged when no target CRS is set.
    pub asset: LocalAsset,
}

struct Progress<'a> {
    item_id: &'a str,
    state: ItemState,
}

impl Progress<'_> {
    fn advance(&mut self, state: ItemState) {
        debug!("{}: {} -> {state}", self.item_id, self.state);
        self.state = state;
    }
}

/// Whether `asset` is a complete GeoTIFF, in `crs` when one is given.
/// Anything else is redone.
fn is_reusable(asset: &LocalAsset, crs: Option<&Crs>) -> bool {
    if !asset.exists() {
        return false;
    }
    match RasterInfo::read_complete(&asset.path) {
        Ok(info) if crs.is_none() || info.crs.as_ref() == crs => true,
        Ok(info) => {
            let found = info.crs.map_or_else(|| "none".to_string(), |crs| crs.to_string());
            warn!("{} is in CRS {found}, redoing it", asset.path.display());
            false
        }
        Err(e) => {
            warn!("{} is unreadable ({e}), redoing it", asset.path.display());
            false
        }
    }
}

/// Runs a selected item through download, merge and reprojection.
///
/// Work already on disk is reused when it reads back as a complete GeoTIFF:
/// a reprojected file in the target CRS finishes the item and a merged file
/// resumes at reprojection. A failing stage stops the item and is reported
/// with its stage; files written by earlier stages are left in place.
pub async fn process_item<T: Transport>(
    downloader: &AssetDownloader<T>,
    item: &CatalogItem,
    options: &ProcessOptions,
) -> Result<ProcessedItem, StageFailure> {
    let item_id = item.id.as_str();
    let dir = options.destination_dir.as_path();
    let mut progress = Progress {
        item_id,
        state: ItemState::Selected,
    };

    if let Some(target) = options.target_crs.as_ref().and_then(|spec| spec.resolve().ok()) {
        let reprojected = LocalAsset::reprojected(item_id, dir);
        if is_reusable(&reprojected, Some(&target)) {
            info!("{item_id} is already processed: {}", reprojected.path.display());
            progress.advance(ItemState::Done);
            return Ok(done(item_id, reprojected));
        }
    }

    let mut merged = LocalAsset::merged(item_id, dir);
    if is_reusable(&merged, None) {
        info!("Found {}, resuming at reprojection", merged.path.display());
        progress.advance(ItemState::Merged);
    } else {
        let downloaded = downloader
            .download(item, &options.bands, dir)
            .await
            .map_err(|e| StageFailure::new(item_id, Stage::Download, e))?;
        progress.advance(ItemState::Downloaded);

        let mut seen = HashSet::new();
        let assets: Vec<LocalAsset> = options
            .bands
            .iter()
            .filter(|band| seen.insert(band.as_str()))
            .filter_map(|band| downloaded.get(band).cloned())
            .collect();
        merged = merge(item_id, &assets, dir, options.delete_intermediate)
            .map_err(|e| StageFailure::new(item_id, Stage::Merge, e))?;
        progress.advance(ItemState::Merged);
    }

    let Some(target) = &options.target_crs else {
        progress.advance(ItemState::Done);
        return Ok(done(item_id, merged));
    };

    let reprojected = reproject(&merged, target, dir, options.delete_intermediate)
        .map_err(|e| StageFailure::new(item_id, Stage::Reproject, e))?;
    progress.advance(ItemState::Reprojected);
    progress.advance(ItemState::Done);
    info!("Finished {item_id}: {}", reprojected.path.display());
    Ok(done(item_id, reprojected))
}

fn done(item_id: &str, asset: LocalAsset) -> ProcessedItem {
    ProcessedItem {
        item_id: item_id.to_owned(),
        state: ItemState::Done,
        asset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::projection::Crs;
    use crate::raster::{Band, BandData, GeoTransform, Raster};
    use crate::transport::HttpTransport;
    use std::path::Path;
    use url::Url;

    fn write_source(dir: &Path, name: &str, value: u16) -> String {
        let path = dir.join(name);
        Raster {
            width: 4,
            height: 4,
            transform: GeoTransform::new(600_000.0, 10.0, 4_100_000.0, -10.0),
            crs: Some(Crs::Epsg(32610)),
            nodata: None,
            bands: vec![Band::new(BandData::U16(vec![value; 16]))],
        }
        .write(&path)
        .unwrap();
        Url::from_file_path(&path).unwrap().to_string()
    }

    fn item(remote: &Path) -> CatalogItem {
        let mut item = CatalogItem::new("S2A_10SDJ");
        item.assets.insert("B04".to_string(), write_source(remote, "B04.tif", 4));
        item.assets.insert("B08".to_string(), write_source(remote, "B08.tif", 8));
        item
    }

    fn options(dir: &Path, target: Option<CrsSpec>) -> ProcessOptions {
        ProcessOptions {
            bands: vec!["B08".to_string(), "B04".to_string()],
            destination_dir: dir.to_path_buf(),
            target_crs: target,
            delete_intermediate: true,
        }
    }

    #[tokio::test]
    async fn test_item_runs_to_done() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());

        let options = options(local.path(), Some(CrsSpec::Code(5070)));
        let processed = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap();
        assert_eq!(processed.state, ItemState::Done);
        assert_eq!(processed.asset, LocalAsset::reprojected("S2A_10SDJ", local.path()));

        let raster = Raster::read(&processed.asset.path).unwrap();
        assert_eq!(raster.crs, Some(Crs::Epsg(5070)));
        let descriptions: Vec<_> =
            raster.bands.iter().map(|b| b.description.clone().unwrap()).collect();
        assert_eq!(descriptions, vec!["B08", "B04"]);
        // Intermediates are gone.
        assert!(!LocalAsset::merged("S2A_10SDJ", local.path()).exists());
        assert!(!local.path().join("S2A_10SDJ_B04.tif").exists());
    }

    #[tokio::test]
    async fn test_without_target_the_merged_file_is_final() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());

        let options = options(local.path(), None);
        let processed = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap();
        assert_eq!(processed.asset, LocalAsset::merged("S2A_10SDJ", local.path()));
        assert!(processed.asset.exists());
    }

    #[tokio::test]
    async fn test_existing_merged_file_resumes_at_reprojection() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());
        let mut item = item(remote.path());

        let options = options(local.path(), None);
        process_item(&downloader, &item, &options).await.unwrap();

        // Downloads would now fail, so success proves they were skipped.
        item.assets.clear();
        let options = ProcessOptions {
            target_crs: Some("EPSG:5070".into()),
            ..options
        };
        let processed = process_item(&downloader, &item, &options).await.unwrap();
        assert_eq!(processed.asset, LocalAsset::reprojected("S2A_10SDJ", local.path()));

        let again = process_item(&downloader, &item, &options).await.unwrap();
        assert_eq!(again.state, ItemState::Done);
    }

    #[tokio::test]
    async fn test_failure_reports_stage() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());
        let mut options = options(local.path(), Some(CrsSpec::Code(99999)));

        let failure = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap_err();
        assert_eq!(failure.item_id, "S2A_10SDJ");
        assert_eq!(failure.stage, Stage::Reproject);
        assert!(matches!(failure.source, Error::UnknownCrs(_)));
        // The merge that preceded the failure stays on disk.
        assert!(LocalAsset::merged("S2A_10SDJ", local.path()).exists());

        options.bands.push("SCL".to_string());
        let local = tempfile::tempdir().unwrap();
        options.destination_dir = local.path().to_path_buf();
        let failure = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Download);
        assert!(matches!(failure.source, Error::AssetNotFound { .. }));
    }

    #[tokio::test]
    async fn test_truncated_outputs_are_redone() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());
        let options = options(local.path(), Some(CrsSpec::Code(5070)));

        let reprojected = LocalAsset::reprojected("S2A_10SDJ", local.path());
        let merged = LocalAsset::merged("S2A_10SDJ", local.path());
        std::fs::write(&reprojected.path, b"II*\0trunc").unwrap();
        std::fs::write(&merged.path, b"II*\0trunc").unwrap();

        let processed = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap();
        assert_eq!(processed.state, ItemState::Done);
        let raster = Raster::read(&processed.asset.path).unwrap();
        assert_eq!(raster.crs, Some(Crs::Epsg(5070)));
        assert_eq!(raster.bands.len(), 2);
    }

    #[tokio::test]
    async fn test_output_in_another_crs_is_redone() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());
        let item = item(remote.path());

        let mut options = options(local.path(), Some(CrsSpec::Code(5070)));
        options.delete_intermediate = false;
        process_item(&downloader, &item, &options).await.unwrap();

        options.target_crs = Some(CrsSpec::Code(32611));
        let processed = process_item(&downloader, &item, &options).await.unwrap();
        let raster = Raster::read(&processed.asset.path).unwrap();
        assert_eq!(raster.crs, Some(Crs::Epsg(32611)));
    }

    #[tokio::test]
    async fn test_repeated_band_is_merged_once() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = AssetDownloader::new(HttpTransport::default());
        let mut options = options(local.path(), None);
        options.bands = ["B08", "B04", "B08"].map(String::from).to_vec();

        let processed = process_item(&downloader, &item(remote.path()), &options)
            .await
            .unwrap();
        let raster = Raster::read(&processed.asset.path).unwrap();
        assert_eq!(raster.bands.len(), 2);
    }
}
