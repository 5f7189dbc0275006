//! GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Reads strip or tiled, chunky images of any integer or float sample type
//! the workflow meets in Sentinel-2 products. Writes one uncompressed strip,
//! chunky, with the georeferencing tags GDAL understands.
//!
//! The `tiff` decoder only knows colour models, so images with a sample
//! count it has no model for (2 bands, 4 grey bands, ...) are read straight
//! from their uncompressed strips instead.
use log::warn;
use num_traits::{Bounded, NumCast, ToPrimitive};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKindStandard, TiffValue};
use tiff::tags::Tag;
use tiff::TiffError;

use crate::asset::partial_path;
use crate::projection::Crs;

// GeoTIFF and GDAL tag codes.
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

// GeoKey ids and values.
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GT_CITATION: u16 = 1026;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const PCS_CITATION: u16 = 3073;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    #[error("{0:?} has no georeferencing tags")]
    MissingGeoreference(PathBuf),

    #[error("Unsupported raster layout: {0}")]
    Unsupported(String),

    #[error("Invalid raster: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, RasterError>;

/// Tags are keyed by their named variant once the decoder knows them.
fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Affine pixel-to-model transform in GDAL order:
/// `x = t[0] + col * t[1] + row * t[2]`, `y = t[3] + col * t[4] + row * t[5]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        Self([origin_x, pixel_width, 0.0, origin_y, 0.0, pixel_height])
    }

    fn from_tiepoint(tiepoint: &[f64], scale: &[f64]) -> Option<Self> {
        if tiepoint.len() < 6 || scale.len() < 2 {
            return None;
        }
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        let (sx, sy) = (scale[0], scale[1]);
        Some(Self([x - i * sx, sx, 0.0, y + j * sy, 0.0, -sy]))
    }

    fn from_matrix(matrix: &[f64]) -> Option<Self> {
        if matrix.len() < 16 {
            return None;
        }
        Some(Self([matrix[3], matrix[0], matrix[1], matrix[7], matrix[4], matrix[5]]))
    }

    fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// Model coordinates of a (fractional) pixel position.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let t = &self.0;
        (t[0] + col * t[1] + row * t[2], t[3] + col * t[4] + row * t[5])
    }

    pub fn invert(&self) -> Option<Self> {
        let t = &self.0;
        let det = t[1] * t[5] - t[2] * t[4];
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let (a, b, d, e) = (t[5] / det, -t[2] / det, -t[4] / det, t[1] / det);
        Some(Self([
            -(a * t[0] + b * t[3]),
            a,
            b,
            -(d * t[0] + e * t[3]),
            d,
            e,
        ]))
    }

    /// Equal within a tolerance relative to the pixel size.
    pub fn approx_eq(&self, other: &Self) -> bool {
        let scale = self.0[1].abs().max(self.0[5].abs()).max(f64::EPSILON);
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= scale * 1e-6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    fn from_tags(bits: u16, format: u16) -> Result<Self> {
        match (format, bits) {
            (1, 8) => Ok(Self::U8),
            (1, 16) => Ok(Self::U16),
            (2, 16) => Ok(Self::I16),
            (1, 32) => Ok(Self::U32),
            (2, 32) => Ok(Self::I32),
            (3, 32) => Ok(Self::F32),
            (3, 64) => Ok(Self::F64),
            _ => Err(RasterError::Unsupported(format!(
                "{bits}-bit samples with sample format {format}"
            ))),
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::U16 | Self::I16 => 16,
            Self::U32 | Self::I32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    pub fn bytes(self) -> usize {
        <usize as From<u16>>::from(self.bits() / 8)
    }

    /// Whether every value of `other` is exactly representable in `self`.
    pub fn holds(self, other: SampleType) -> bool {
        use SampleType::*;
        match self {
            U8 => other == U8,
            U16 => matches!(other, U8 | U16),
            I16 => matches!(other, U8 | I16),
            U32 => matches!(other, U8 | U16 | U32),
            I32 => matches!(other, U8 | U16 | I16 | I32),
            F32 => matches!(other, U8 | U16 | I16 | F32),
            F64 => true,
        }
    }

    /// The narrowest type holding every value of both.
    pub fn common(self, other: SampleType) -> SampleType {
        use SampleType::*;
        [U8, U16, I16, U32, I32, F32, F64]
            .into_iter()
            .find(|candidate| candidate.holds(self) && candidate.holds(other))
            .unwrap_or(F64)
    }

    /// TIFF SampleFormat: 1 unsigned, 2 signed, 3 IEEE float.
    fn format(self) -> u16 {
        match self {
            Self::U8 | Self::U16 | Self::U32 => 1,
            Self::I16 | Self::I32 => 2,
            Self::F32 | Self::F64 => 3,
        }
    }
}

/// Pixel values of one band, row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum BandData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! for_each_band_type {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            BandData::U8($values) => $body,
            BandData::U16($values) => $body,
            BandData::I16($values) => $body,
            BandData::U32($values) => $body,
            BandData::I32($values) => $body,
            BandData::F32($values) => $body,
            BandData::F64($values) => $body,
        }
    };
}

macro_rules! convert_band {
    ($values:expr, $target:expr) => {
        match $target {
            SampleType::U8 => BandData::U8(convert_all($values)),
            SampleType::U16 => BandData::U16(convert_all($values)),
            SampleType::I16 => BandData::I16(convert_all($values)),
            SampleType::U32 => BandData::U32(convert_all($values)),
            SampleType::I32 => BandData::I32(convert_all($values)),
            SampleType::F32 => BandData::F32(convert_all($values)),
            SampleType::F64 => BandData::F64(convert_all($values)),
        }
    };
}

/// Numeric conversion that saturates at the target's range. NaN becomes
/// the minimum of integer targets and stays NaN for floats.
fn convert<S: ToPrimitive + Copy, D: NumCast + Bounded>(value: S) -> D {
    let value = value.to_f64().unwrap_or(f64::NAN);
    NumCast::from(value).unwrap_or_else(|| {
        if value > 0.0 {
            D::max_value()
        } else {
            D::min_value()
        }
    })
}

fn convert_all<S: ToPrimitive + Copy, D: NumCast + Bounded>(values: &[S]) -> Vec<D> {
    values.iter().map(|v| convert(*v)).collect()
}

fn gather<T: Copy>(values: &[T], indices: &[Option<usize>], fill: T) -> Vec<T> {
    indices
        .iter()
        .map(|index| index.and_then(|i| values.get(i).copied()).unwrap_or(fill))
        .collect()
}

impl BandData {
    pub fn sample_type(&self) -> SampleType {
        match self {
            Self::U8(_) => SampleType::U8,
            Self::U16(_) => SampleType::U16,
            Self::I16(_) => SampleType::I16,
            Self::U32(_) => SampleType::U32,
            Self::I32(_) => SampleType::I32,
            Self::F32(_) => SampleType::F32,
            Self::F64(_) => SampleType::F64,
        }
    }

    pub fn len(&self) -> usize {
        for_each_band_type!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index` as `f64`.
    pub fn value(&self, index: usize) -> Option<f64> {
        for_each_band_type!(self, values => values.get(index).and_then(|v| v.to_f64()))
    }

    pub fn cast(&self, target: SampleType) -> BandData {
        if self.sample_type() == target {
            return self.clone();
        }
        for_each_band_type!(self, values => convert_band!(values, target))
    }

    /// A new band whose pixel `k` is `self[indices[k]]`, or `fill` where the
    /// index is `None`.
    pub fn gather(&self, indices: &[Option<usize>], fill: f64) -> BandData {
        match self {
            Self::U8(values) => Self::U8(gather(values, indices, convert(fill))),
            Self::U16(values) => Self::U16(gather(values, indices, convert(fill))),
            Self::I16(values) => Self::I16(gather(values, indices, convert(fill))),
            Self::U32(values) => Self::U32(gather(values, indices, convert(fill))),
            Self::I32(values) => Self::I32(gather(values, indices, convert(fill))),
            Self::F32(values) => Self::F32(gather(values, indices, convert(fill))),
            Self::F64(values) => Self::F64(gather(values, indices, fill)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub data: BandData,
    pub description: Option<String>,
    /// Per-band metadata items, stored in GDAL_METADATA.
    pub tags: BTreeMap<String, String>,
}

impl Band {
    pub fn new(data: BandData) -> Self {
        Self {
            data,
            description: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_owned());
        self
    }

    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.insert(name.to_owned(), value.to_owned());
        self
    }
}

/// Header-level facts about a GeoTIFF.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub band_count: usize,
    pub sample_type: SampleType,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
}

impl RasterInfo {
    /// Reads the first image directory without decoding pixels.
    pub fn read(path: &Path) -> Result<Self> {
        let mut decoder = open(path)?;
        read_info(&mut decoder, path)
    }

    /// Like [`RasterInfo::read`], and also checks that every strip or tile
    /// the header points at lies inside the file.
    pub fn read_complete(path: &Path) -> Result<Self> {
        let mut decoder = open(path)?;
        let info = read_info(&mut decoder, path)?;
        let (offsets, byte_counts) = match decoder.find_tag(Tag::TileOffsets)? {
            Some(offsets) => {
                (offsets.into_u64_vec()?, decoder.get_tag_u64_vec(Tag::TileByteCounts)?)
            }
            None => (
                decoder.get_tag_u64_vec(Tag::StripOffsets)?,
                decoder.get_tag_u64_vec(Tag::StripByteCounts)?,
            ),
        };

        let file_len = fs::metadata(path)?.len();
        let end = offsets
            .iter()
            .zip(&byte_counts)
            .map(|(offset, count)| offset.saturating_add(*count))
            .max()
            .unwrap_or(u64::MAX);
        if offsets.len() != byte_counts.len() || end > file_len {
            return Err(RasterError::Invalid(format!("{} is truncated", path.display())));
        }
        Ok(info)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
    pub bands: Vec<Band>,
}

impl Raster {
    pub fn read(path: &Path) -> Result<Self> {
        let mut decoder = open(path)?;
        let info = read_info(&mut decoder, path)?;
        let mut metadata = read_metadata(&mut decoder)?;

        let samples = info.band_count;
        let bands = match decoder.colortype() {
            Ok(_) => match decoder.read_image()? {
                DecodingResult::U8(v) => deinterleave(&v, samples, BandData::U8),
                DecodingResult::U16(v) => deinterleave(&v, samples, BandData::U16),
                DecodingResult::I16(v) => deinterleave(&v, samples, BandData::I16),
                DecodingResult::U32(v) => deinterleave(&v, samples, BandData::U32),
                DecodingResult::I32(v) => deinterleave(&v, samples, BandData::I32),
                DecodingResult::F32(v) => deinterleave(&v, samples, BandData::F32),
                DecodingResult::F64(v) => deinterleave(&v, samples, BandData::F64),
                _ => {
                    return Err(RasterError::Unsupported(format!(
                        "sample type of {}",
                        path.display()
                    )))
                }
            },
            Err(TiffError::UnsupportedError(_)) if samples > 1 => {
                read_uncompressed_strips(&mut decoder, path, &info)?
            }
            Err(e) => return Err(e.into()),
        };

        let bands = bands
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let band = metadata.remove(&i).unwrap_or_default();
                Band {
                    data,
                    description: band.description,
                    tags: band.tags,
                }
            })
            .collect();

        Ok(Self {
            width: info.width,
            height: info.height,
            transform: info.transform,
            crs: info.crs,
            nodata: info.nodata,
            bands,
        })
    }

    pub fn sample_type(&self) -> Option<SampleType> {
        self.bands.first().map(|band| band.data.sample_type())
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn validate(&self) -> Result<SampleType> {
        let sample_type = self
            .sample_type()
            .ok_or_else(|| RasterError::Invalid("raster has no bands".to_string()))?;
        if self.width == 0 || self.height == 0 {
            return Err(RasterError::Invalid("raster has zero dimensions".to_string()));
        }
        for (i, band) in self.bands.iter().enumerate() {
            if band.data.sample_type() != sample_type {
                return Err(RasterError::Invalid(format!(
                    "band {i} is {:?}, expected {sample_type:?}",
                    band.data.sample_type()
                )));
            }
            if band.data.len() != self.pixel_count() {
                return Err(RasterError::Invalid(format!(
                    "band {i} has {} pixels, expected {}",
                    band.data.len(),
                    self.pixel_count()
                )));
            }
        }
        Ok(sample_type)
    }

    /// Writes the raster to `<path>.part` and renames it to `path` once
    /// complete, so `path` never holds a partial image.
    pub fn write(&self, path: &Path) -> Result<()> {
        let sample_type = self.validate()?;
        let part = partial_path(path);
        if let Err(e) = self.write_tiff(&part, sample_type) {
            if let Err(remove_err) = fs::remove_file(&part) {
                warn!("Could not remove incomplete {}: {remove_err}", part.display());
            }
            return Err(e);
        }
        fs::rename(&part, path)?;
        Ok(())
    }

    fn write_tiff(&self, path: &Path, sample_type: SampleType) -> Result<()> {
        let band_count = self.bands.len();
        let band_count_u16 = u16::try_from(band_count)
            .map_err(|_| RasterError::Invalid(format!("{band_count} bands")))?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(&file);
        {
            let mut encoder = TiffEncoder::new(&mut writer)?;
            let mut dir = encoder.new_directory()?;

            dir.write_tag(Tag::ImageWidth, self.width)?;
            dir.write_tag(Tag::ImageLength, self.height)?;
            dir.write_tag(Tag::BitsPerSample, vec![sample_type.bits(); band_count].as_slice())?;
            dir.write_tag(Tag::Compression, 1u16)?;
            // RGB for 8-bit true colour, BlackIsZero plus extra samples otherwise
            let photometric = if band_count == 3 && sample_type == SampleType::U8 {
                2u16
            } else {
                1u16
            };
            dir.write_tag(Tag::PhotometricInterpretation, photometric)?;
            dir.write_tag(Tag::SamplesPerPixel, band_count_u16)?;
            dir.write_tag(Tag::SampleFormat, vec![sample_type.format(); band_count].as_slice())?;
            dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
            dir.write_tag(Tag::RowsPerStrip, self.height)?;
            let colour_samples = if photometric == 2 { 3 } else { 1 };
            if band_count > colour_samples {
                let extra = vec![0u16; band_count - colour_samples];
                dir.write_tag(Tag::ExtraSamples, extra.as_slice())?;
            }

            self.write_geotiff_tags(&mut dir)?;

            match sample_type {
                SampleType::U8 => write_strip(&mut dir, &interleave(&self.bands, as_u8)?)?,
                SampleType::U16 => write_strip(&mut dir, &interleave(&self.bands, as_u16)?)?,
                SampleType::I16 => write_strip(&mut dir, &interleave(&self.bands, as_i16)?)?,
                SampleType::U32 => write_strip(&mut dir, &interleave(&self.bands, as_u32)?)?,
                SampleType::I32 => write_strip(&mut dir, &interleave(&self.bands, as_i32)?)?,
                SampleType::F32 => write_strip(&mut dir, &interleave(&self.bands, as_f32)?)?,
                SampleType::F64 => write_strip(&mut dir, &interleave(&self.bands, as_f64)?)?,
            }

            dir.finish()?;
        }
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        Ok(())
    }

    fn write_geotiff_tags<W: Write + Seek>(
        &self,
        dir: &mut DirectoryEncoder<W, TiffKindStandard>,
    ) -> Result<()> {
        let t = &self.transform.0;
        if self.transform.is_north_up() {
            let pixel_scale = [t[1], -t[5], 0.0];
            dir.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), pixel_scale.as_slice())?;
            let tiepoint = [0.0, 0.0, 0.0, t[0], t[3], 0.0];
            dir.write_tag(Tag::Unknown(MODEL_TIEPOINT), tiepoint.as_slice())?;
        } else {
            let matrix = [
                t[1], t[2], 0.0, t[0], //
                t[4], t[5], 0.0, t[3], //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ];
            dir.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), matrix.as_slice())?;
        }

        if let Some(crs) = &self.crs {
            let (keys, ascii) = geokey_directory(crs);
            dir.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), keys.as_slice())?;
            if let Some(ascii) = ascii {
                dir.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), ascii.as_str())?;
            }
        }

        if let Some(nodata) = self.nodata {
            dir.write_tag(Tag::Unknown(GDAL_NODATA), nodata.to_string().as_str())?;
        }

        if self.bands.iter().any(|band| band.description.is_some() || !band.tags.is_empty()) {
            dir.write_tag(Tag::Unknown(GDAL_METADATA), gdal_metadata(&self.bands).as_str())?;
        }
        Ok(())
    }
}

fn open(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    Ok(decoder)
}

fn read_info(decoder: &mut Decoder<BufReader<File>>, path: &Path) -> Result<RasterInfo> {
    let (width, height) = decoder.dimensions()?;

    let band_count = decoder
        .find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?
        .unwrap_or(1) as usize;
    if decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?.unwrap_or(1) != 1 {
        return Err(RasterError::Unsupported(format!("planar layout of {}", path.display())));
    }

    let bits = decoder
        .find_tag_unsigned_vec::<u16>(Tag::BitsPerSample)?
        .unwrap_or_else(|| vec![1]);
    let formats = decoder
        .find_tag_unsigned_vec::<u16>(Tag::SampleFormat)?
        .unwrap_or_else(|| vec![1]);
    if bits.windows(2).any(|w| w[0] != w[1]) || formats.windows(2).any(|w| w[0] != w[1]) {
        return Err(RasterError::Unsupported(format!(
            "mixed sample types in {}",
            path.display()
        )));
    }
    let sample_type = SampleType::from_tags(
        bits.first().copied().unwrap_or(1),
        formats.first().copied().unwrap_or(1),
    )?;

    let transform =
        read_transform(decoder)?.ok_or_else(|| RasterError::MissingGeoreference(path.to_owned()))?;
    let crs = read_crs(decoder)?;
    let nodata = find_string(decoder, GDAL_NODATA)?
        .and_then(|text| text.trim().trim_end_matches('\0').parse().ok());

    Ok(RasterInfo {
        width,
        height,
        band_count,
        sample_type,
        transform,
        crs,
        nodata,
    })
}

fn find_f64_vec<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Result<Option<Vec<f64>>> {
    Ok(decoder.find_tag(tag(code))?.map(Value::into_f64_vec).transpose()?)
}

fn find_string<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Result<Option<String>> {
    Ok(decoder.find_tag(tag(code))?.map(Value::into_string).transpose()?)
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<GeoTransform>> {
    if let Some(matrix) = find_f64_vec(decoder, MODEL_TRANSFORMATION)? {
        return Ok(GeoTransform::from_matrix(&matrix));
    }
    let tiepoint = find_f64_vec(decoder, MODEL_TIEPOINT)?;
    let scale = find_f64_vec(decoder, MODEL_PIXEL_SCALE)?;
    Ok(match (tiepoint, scale) {
        (Some(tiepoint), Some(scale)) => GeoTransform::from_tiepoint(&tiepoint, &scale),
        _ => None,
    })
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<Crs>> {
    let Some(directory) = decoder.find_tag_unsigned_vec::<u16>(tag(GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    let ascii = find_string(decoder, GEO_ASCII_PARAMS)?.unwrap_or_default();
    Ok(crs_from_geokeys(&directory, &ascii))
}

/// Picks the CRS out of a GeoKeyDirectory. User-defined systems are only
/// understood when a citation holds a PROJ.4 string.
fn crs_from_geokeys(directory: &[u16], ascii: &str) -> Option<Crs> {
    let key_count = *directory.get(3)? as usize;
    let mut projected = None;
    let mut geographic = None;
    let mut citations = vec![];
    for key in directory.get(4..4 + key_count * 4)?.chunks_exact(4) {
        let (id, location, count, value) = (key[0], key[1], key[2] as usize, key[3] as usize);
        match id {
            PROJECTED_CS_TYPE if location == 0 => projected = Some(key[3]),
            GEOGRAPHIC_TYPE if location == 0 => geographic = Some(key[3]),
            GT_CITATION | PCS_CITATION if location == GEO_ASCII_PARAMS => {
                if let Some(text) = ascii.get(value..value + count) {
                    citations.push(text.trim_end_matches(['|', '\0']).trim().to_owned());
                }
            }
            _ => {}
        }
    }

    match projected.or(geographic) {
        Some(code) if code != USER_DEFINED => Some(Crs::Epsg(code)),
        _ => citations
            .into_iter()
            .find(|text| text.starts_with("+proj="))
            .map(Crs::Proj4),
    }
}

fn geokey_directory(crs: &Crs) -> (Vec<u16>, Option<String>) {
    let geographic = crs.is_geographic();
    let model_type = if geographic { MODEL_TYPE_GEOGRAPHIC } else { MODEL_TYPE_PROJECTED };
    let type_key = if geographic { GEOGRAPHIC_TYPE } else { PROJECTED_CS_TYPE };

    let mut keys: Vec<[u16; 4]> = vec![
        [GT_MODEL_TYPE, 0, 1, model_type],
        [GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA],
    ];
    let ascii = match crs {
        Crs::Epsg(code) => {
            keys.push([type_key, 0, 1, *code]);
            None
        }
        Crs::Proj4(definition) => {
            let ascii = format!("{definition}|");
            let count = u16::try_from(ascii.len()).unwrap_or(u16::MAX);
            keys.push([GT_CITATION, GEO_ASCII_PARAMS, count, 0]);
            keys.push([type_key, 0, 1, USER_DEFINED]);
            Some(ascii)
        }
    };

    let mut directory = vec![1, 1, 0, keys.len() as u16];
    directory.extend(keys.into_iter().flatten());
    (directory, ascii)
}

fn gdal_metadata(bands: &[Band]) -> String {
    let mut xml = String::from("<GDALMetadata>\n");
    for (i, band) in bands.iter().enumerate() {
        for (name, value) in &band.tags {
            xml.push_str(&format!(
                "  <Item name=\"{}\" sample=\"{i}\">{}</Item>\n",
                escape_xml(name),
                escape_xml(value)
            ));
        }
        if let Some(description) = &band.description {
            xml.push_str(&format!(
                "  <Item name=\"DESCRIPTION\" sample=\"{i}\" role=\"description\">{}</Item>\n",
                escape_xml(description)
            ));
        }
    }
    xml.push_str("</GDALMetadata>");
    xml
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[derive(Debug, Default, Clone, PartialEq)]
struct BandMetadata {
    description: Option<String>,
    tags: BTreeMap<String, String>,
}

/// Band items of a GDAL_METADATA document, by zero-based sample. Dataset
/// items (no `sample`) and roles other than `description` are skipped.
fn parse_metadata(xml: &str) -> HashMap<usize, BandMetadata> {
    let mut bands: HashMap<usize, BandMetadata> = HashMap::new();
    let Ok(item) =
        Regex::new(r#"<Item name="([^"]*)" sample="(\d+)"(?: role="([^"]*)")?>([^<]*)</Item>"#)
    else {
        return bands;
    };
    for c in item.captures_iter(xml) {
        let Ok(sample) = c[2].parse() else {
            continue;
        };
        let value = unescape_xml(&c[4]);
        let band = bands.entry(sample).or_default();
        match c.get(3).map(|role| role.as_str()) {
            Some("description") => band.description = Some(value),
            Some(_) => {}
            None => {
                band.tags.insert(unescape_xml(&c[1]), value);
            }
        }
    }
    bands
}

fn read_metadata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<HashMap<usize, BandMetadata>> {
    Ok(find_string(decoder, GDAL_METADATA)?
        .map(|xml| parse_metadata(&xml))
        .unwrap_or_default())
}

macro_rules! decode_samples {
    ($bytes:expr, $little_endian:expr, $ty:ty) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$ty>())
            .map(|chunk| {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(chunk);
                if $little_endian {
                    <$ty>::from_le_bytes(raw)
                } else {
                    <$ty>::from_be_bytes(raw)
                }
            })
            .collect::<Vec<$ty>>()
    };
}

/// Pixels of an uncompressed, chunky, strip-organised image, read from the
/// byte ranges its StripOffsets and StripByteCounts name.
fn read_uncompressed_strips<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
    info: &RasterInfo,
) -> Result<Vec<BandData>> {
    let compression = decoder.find_tag_unsigned::<u16>(Tag::Compression)?.unwrap_or(1);
    let predictor = decoder.find_tag_unsigned::<u16>(Tag::Predictor)?.unwrap_or(1);
    if compression != 1 || predictor != 1 || decoder.find_tag(Tag::TileWidth)?.is_some() {
        return Err(RasterError::Unsupported(format!(
            "{}-band image with compression {compression} in {}",
            info.band_count,
            path.display()
        )));
    }
    let offsets = decoder.get_tag_u64_vec(Tag::StripOffsets)?;
    let byte_counts = decoder.get_tag_u64_vec(Tag::StripByteCounts)?;

    let expected = info.pixel_count() * info.band_count * info.sample_type.bytes();
    let mut file = File::open(path)?;
    let mut byte_order = [0u8; 2];
    file.read_exact(&mut byte_order)?;
    let little_endian = &byte_order == b"II";

    let mut bytes = Vec::with_capacity(expected);
    for (offset, count) in offsets.iter().zip(&byte_counts) {
        let take = usize::try_from(*count).unwrap_or(usize::MAX).min(expected - bytes.len());
        if take == 0 {
            break;
        }
        file.seek(SeekFrom::Start(*offset))?;
        let start = bytes.len();
        bytes.resize(start + take, 0);
        file.read_exact(&mut bytes[start..])?;
    }
    if bytes.len() != expected {
        return Err(RasterError::Invalid(format!(
            "{} holds {} of {expected} pixel bytes",
            path.display(),
            bytes.len()
        )));
    }

    let samples = info.band_count;
    Ok(match info.sample_type {
        SampleType::U8 => deinterleave(&bytes, samples, BandData::U8),
        SampleType::U16 => {
            deinterleave(&decode_samples!(bytes, little_endian, u16), samples, BandData::U16)
        }
        SampleType::I16 => {
            deinterleave(&decode_samples!(bytes, little_endian, i16), samples, BandData::I16)
        }
        SampleType::U32 => {
            deinterleave(&decode_samples!(bytes, little_endian, u32), samples, BandData::U32)
        }
        SampleType::I32 => {
            deinterleave(&decode_samples!(bytes, little_endian, i32), samples, BandData::I32)
        }
        SampleType::F32 => {
            deinterleave(&decode_samples!(bytes, little_endian, f32), samples, BandData::F32)
        }
        SampleType::F64 => {
            deinterleave(&decode_samples!(bytes, little_endian, f64), samples, BandData::F64)
        }
    })
}

fn deinterleave<T: Copy>(
    values: &[T],
    samples: usize,
    wrap: fn(Vec<T>) -> BandData,
) -> Vec<BandData> {
    let samples = samples.max(1);
    (0..samples)
        .map(|band| wrap(values.iter().skip(band).step_by(samples).copied().collect()))
        .collect()
}

fn as_u8(data: &BandData) -> Option<&[u8]> {
    match data {
        BandData::U8(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_u16(data: &BandData) -> Option<&[u16]> {
    match data {
        BandData::U16(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_i16(data: &BandData) -> Option<&[i16]> {
    match data {
        BandData::I16(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_u32(data: &BandData) -> Option<&[u32]> {
    match data {
        BandData::U32(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_i32(data: &BandData) -> Option<&[i32]> {
    match data {
        BandData::I32(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_f32(data: &BandData) -> Option<&[f32]> {
    match data {
        BandData::F32(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn as_f64(data: &BandData) -> Option<&[f64]> {
    match data {
        BandData::F64(v) => Some(v.as_slice()),
        _ => None,
    }
}

fn interleave<T: Copy>(bands: &[Band], view: fn(&BandData) -> Option<&[T]>) -> Result<Vec<T>> {
    let slices = bands
        .iter()
        .map(|band| {
            view(&band.data)
                .ok_or_else(|| RasterError::Invalid("mixed band sample types".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    let pixels = slices.first().map_or(0, |s| s.len());
    let mut out = Vec::with_capacity(pixels * slices.len());
    for i in 0..pixels {
        out.extend(slices.iter().map(|s| s[i]));
    }
    Ok(out)
}

fn write_strip<W: Write + Seek, T>(
    dir: &mut DirectoryEncoder<W, TiffKindStandard>,
    pixels: &[T],
) -> Result<()>
where
    [T]: TiffValue,
{
    let offset = dir.write_data(pixels)?;
    let offset = u32::try_from(offset)
        .map_err(|_| RasterError::Invalid("image exceeds 4 GiB".to_string()))?;
    let byte_count = u32::try_from(std::mem::size_of_val(pixels))
        .map_err(|_| RasterError::Invalid("image exceeds 4 GiB".to_string()))?;
    dir.write_tag(Tag::StripOffsets, offset)?;
    dir.write_tag(Tag::StripByteCounts, byte_count)?;
    Ok(())
}
