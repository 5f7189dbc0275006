//! Nearest-neighbour reprojection of a GeoTIFF onto a new CRS.
use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::asset::{delete_consumed, LocalAsset};
use crate::error::{Error, Result};
use crate::projection::{CoordTransformer, Crs, CrsSpec};
use crate::raster::{Band, GeoTransform, Raster};

/// Points sampled along each edge when estimating the output footprint.
const EDGE_SAMPLES: usize = 21;
/// Output pixels between exactly transformed ones; the rest of a row is
/// interpolated linearly.
const APPROX_STEP: usize = 16;

/// Output grid covering the same ground footprint as the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGrid {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
}

impl TargetGrid {
    /// Transforms points along the source's outer edges and takes their
    /// bounding box. Square pixels are sized so the source diagonal spans the
    /// same number of pixels in both systems.
    pub fn covering(
        width: u32,
        height: u32,
        transform: &GeoTransform,
        to_target: &CoordTransformer,
    ) -> Result<Self> {
        let (w, h) = (f64::from(width), f64::from(height));
        let mut edge = Vec::with_capacity(EDGE_SAMPLES * 4);
        for i in 0..EDGE_SAMPLES {
            let f = i as f64 / (EDGE_SAMPLES - 1) as f64;
            edge.extend([(f * w, 0.0), (f * w, h), (0.0, f * h), (w, f * h)]);
        }

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (col, row) in edge {
            let (x, y) = transform.apply(col, row);
            let Ok((x, y)) = to_target.transform(x, y) else {
                continue;
            };
            if x.is_finite() && y.is_finite() {
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
        if !(min_x < max_x && min_y < max_y) {
            return Err(Error::Projection(
                "source footprint does not map into the target CRS".to_string(),
            ));
        }

        let (x0, y0) = transform.apply(0.0, 0.0);
        let (x1, y1) = transform.apply(w, h);
        let (tx0, ty0) = to_target.transform(x0, y0)?;
        let (tx1, ty1) = to_target.transform(x1, y1)?;
        let diagonal = (tx1 - tx0).hypot(ty1 - ty0);
        let resolution = diagonal / w.hypot(h);
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(Error::Projection(format!("degenerate output resolution {resolution}")));
        }

        let cells = |extent: f64| ((extent / resolution) - 1e-6).ceil().max(1.0);
        Ok(Self {
            width: cells(max_x - min_x) as u32,
            height: cells(max_y - min_y) as u32,
            transform: GeoTransform::new(min_x, resolution, max_y, -resolution),
        })
    }
}

/// Reprojects `asset` to `target`, writing `<destination_dir>/<item_id>_reprojected.tif`.
///
/// The target is resolved before the source is opened, so an unknown CRS
/// fails with [`Error::UnknownCrs`] without touching any file. Band count,
/// order, descriptions, tags and nodata carry over; output pixels that fall
/// outside the source get the nodata value, or 0.
pub fn reproject(
    asset: &LocalAsset,
    target: &CrsSpec,
    destination_dir: &Path,
    delete_source: bool,
) -> Result<LocalAsset> {
    let target_crs = target.resolve()?;

    let source = Raster::read(&asset.path)?;
    let source_crs = source
        .crs
        .clone()
        .ok_or_else(|| Error::Projection(format!("{} has no CRS", asset.path.display())))?;
    info!("Reprojecting {} from {source_crs} to {target_crs}", asset.item_id);

    let reprojected = warp(&source, &source_crs, &target_crs)?;

    fs::create_dir_all(destination_dir)?;
    let output = LocalAsset::reprojected(&asset.item_id, destination_dir);
    reprojected.write(&output.path)?;
    info!("Reprojected asset written to {}", output.path.display());

    if delete_source {
        delete_consumed(std::slice::from_ref(asset));
    }
    Ok(output)
}

fn warp(source: &Raster, source_crs: &Crs, target_crs: &Crs) -> Result<Raster> {
    let to_target = CoordTransformer::new(source_crs, target_crs)?;
    let to_source = CoordTransformer::new(target_crs, source_crs)?;
    let grid = TargetGrid::covering(source.width, source.height, &source.transform, &to_target)?;
    debug!("Output grid {}x{} with transform {:?}", grid.width, grid.height, grid.transform.0);

    let pixel_of = source
        .transform
        .invert()
        .ok_or_else(|| Error::Projection("source transform is not invertible".to_string()))?;

    let (src_w, src_h) = (source.width as usize, source.height as usize);
    let (dst_w, dst_h) = (grid.width as usize, grid.height as usize);
    let locate = |col: f64, row: f64| -> Option<(f64, f64)> {
        let (x, y) = grid.transform.apply(col, row);
        let (x, y) = to_source.transform(x, y).ok()?;
        Some(pixel_of.apply(x, y))
    };

    let mut indices = Vec::with_capacity(dst_w * dst_h);
    let mut samples: Vec<(usize, Option<(f64, f64)>)> = Vec::new();
    for row in 0..dst_h {
        let centre_row = row as f64 + 0.5;
        samples.clear();
        for col in (0..dst_w).step_by(APPROX_STEP).chain(std::iter::once(dst_w - 1)) {
            if samples.last().is_some_and(|(last, _)| *last == col) {
                continue;
            }
            samples.push((col, locate(col as f64 + 0.5, centre_row)));
        }

        for pair in samples.windows(2) {
            let ((c0, p0), (c1, p1)) = (pair[0], pair[1]);
            let end = if c1 == dst_w - 1 { c1 + 1 } else { c1 };
            for col in c0..end {
                let position = match (p0, p1) {
                    _ if col == c0 => p0,
                    _ if col == c1 => p1,
                    (Some((x0, y0)), Some((x1, y1))) => {
                        let f = (col - c0) as f64 / (c1 - c0) as f64;
                        Some((x0 + (x1 - x0) * f, y0 + (y1 - y0) * f))
                    }
                    _ => locate(col as f64 + 0.5, centre_row),
                };
                indices.push(position.and_then(|(sx, sy)| source_index(sx, sy, src_w, src_h)));
            }
        }
        if samples.len() == 1 {
            let (_, position) = samples[0];
            indices.push(position.and_then(|(sx, sy)| source_index(sx, sy, src_w, src_h)));
        }
    }

    let fill = source.nodata.unwrap_or(0.0);
    let bands = source
        .bands
        .iter()
        .map(|band| Band {
            data: band.data.gather(&indices, fill),
            description: band.description.clone(),
            tags: band.tags.clone(),
        })
        .collect();

    Ok(Raster {
        width: grid.width,
        height: grid.height,
        transform: grid.transform,
        crs: Some(target_crs.clone()),
        nodata: source.nodata,
        bands,
    })
}

fn source_index(col: f64, row: f64, width: usize, height: usize) -> Option<usize> {
    if !(col >= 0.0 && row >= 0.0) {
        return None;
    }
    let (col, row) = (col.floor() as usize, row.floor() as usize);
    (col < width && row < height).then_some(row * width + col)
}
