//! Stacks the single-band downloads of one item into a multi-band GeoTIFF.
use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::asset::{delete_consumed, LocalAsset};
use crate::error::{Error, Result};
use crate::raster::{Band, Raster, RasterError, RasterInfo};

/// Writes `<destination_dir>/<item_id>_merged.tif` holding every band of
/// `assets`, in the order given.
///
/// The first asset is the template: its transform, CRS and nodata value
/// carry over. Pixels are copied unchanged; when inputs differ in sample
/// type every band is widened to the narrowest type holding all of them.
/// Each band keeps its metadata tags. Every header is checked before
/// anything is written, so a [`Error::GeometryMismatch`] leaves no output
/// behind. Sources are deleted only after the output is complete, when
/// `delete_sources` is set.
pub fn merge(
    item_id: &str,
    assets: &[LocalAsset],
    destination_dir: &Path,
    delete_sources: bool,
) -> Result<LocalAsset> {
    let Some((template_asset, others)) = assets.split_first() else {
        return Err(RasterError::Invalid(format!("no assets to merge for {item_id}")).into());
    };

    let template = RasterInfo::read(&template_asset.path)?;
    let mut total_band_count = template.band_count;
    let mut sample_type = template.sample_type;
    for other_asset in others {
        let other = RasterInfo::read(&other_asset.path)?;
        check_geometry(&template, &other).map_err(|reason| Error::GeometryMismatch {
            template: template_asset.path.clone(),
            other: other_asset.path.clone(),
            reason,
        })?;
        total_band_count += other.band_count;
        sample_type = sample_type.common(other.sample_type);
    }
    info!("Merging {} file(s) of {item_id} into {total_band_count} band(s)", assets.len());
    if sample_type != template.sample_type {
        debug!("Mixed sample types in {item_id}, merging as {sample_type:?}");
    }

    let mut bands = Vec::with_capacity(total_band_count);
    for asset in assets {
        let raster = Raster::read(&asset.path)?;
        let name = band_label(asset);
        let band_count = raster.bands.len();
        for (i, band) in raster.bands.into_iter().enumerate() {
            let description = if band_count > 1 {
                format!("{name}-{}", i + 1)
            } else {
                name.clone()
            };
            bands.push(Band {
                data: band.data.cast(sample_type),
                description: Some(description),
                tags: band.tags,
            });
        }
    }

    fs::create_dir_all(destination_dir)?;
    let merged = LocalAsset::merged(item_id, destination_dir);
    let raster = Raster {
        width: template.width,
        height: template.height,
        transform: template.transform,
        crs: template.crs,
        nodata: template.nodata,
        bands,
    };
    raster.write(&merged.path)?;
    info!("Merged asset written to {}", merged.path.display());

    if delete_sources {
        delete_consumed(assets);
    }
    Ok(merged)
}

fn check_geometry(template: &RasterInfo, other: &RasterInfo) -> std::result::Result<(), String> {
    if (template.width, template.height) != (other.width, other.height) {
        return Err(format!(
            "{}x{} pixels instead of {}x{}",
            other.width, other.height, template.width, template.height
        ));
    }
    if !template.transform.approx_eq(&other.transform) {
        return Err(format!(
            "geotransform {:?} instead of {:?}",
            other.transform.0, template.transform.0
        ));
    }
    if let (Some(expected), Some(found)) = (&template.crs, &other.crs) {
        if expected != found {
            return Err(format!("CRS {found} instead of {expected}"));
        }
    }
    Ok(())
}

fn band_label(asset: &LocalAsset) -> String {
    match asset.band_name() {
        Some(band) => band.to_owned(),
        None => asset
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| asset.item_id.clone()),
    }
}
