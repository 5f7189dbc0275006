//! Coordinate reference systems and point transforms.
//!
//! EPSG definitions come from the `crs-definitions` database and are run
//! through `proj4rs`, so no system PROJ install is involved.
use log::warn;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Crs {
    Epsg(u16),
    Proj4(String),
}

impl Crs {
    pub fn epsg(&self) -> Option<u16> {
        match self {
            Self::Epsg(code) => Some(*code),
            Self::Proj4(_) => None,
        }
    }

    /// PROJ.4 definition, looked up for EPSG codes.
    pub fn proj4_string(&self) -> Result<&str> {
        match self {
            Self::Epsg(code) => {
                epsg_to_proj_string(*code).ok_or_else(|| Error::UnknownCrs(self.to_string()))
            }
            Self::Proj4(definition) => Ok(definition),
        }
    }

    pub fn is_geographic(&self) -> bool {
        match self.proj4_string() {
            Ok(definition) => is_longlat(definition),
            Err(_) => self.epsg().is_some_and(|code| (4000..5000).contains(&code)),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epsg(code) => write!(f, "EPSG:{code}"),
            Self::Proj4(definition) => f.write_str(definition),
        }
    }
}

fn epsg_to_proj_string(code: u16) -> Option<&'static str> {
    crs_definitions::from_code(code).map(|def| def.proj4)
}

fn is_longlat(definition: &str) -> bool {
    definition.contains("+proj=longlat") || definition.contains("+proj=latlong")
}

/// A reprojection target as configured: an EPSG code, or text naming one
/// (`"5070"`, `"EPSG:5070"`) or defining one (`"+proj=aea ..."`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CrsSpec {
    Code(u32),
    Definition(String),
}

impl From<u32> for CrsSpec {
    fn from(code: u32) -> Self {
        Self::Code(code)
    }
}

impl From<&str> for CrsSpec {
    fn from(definition: &str) -> Self {
        Self::Definition(definition.to_owned())
    }
}

impl fmt::Display for CrsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Definition(definition) => f.write_str(definition),
        }
    }
}

impl CrsSpec {
    /// Resolves to a known CRS or fails with [`Error::UnknownCrs`].
    pub fn resolve(&self) -> Result<Crs> {
        match self {
            Self::Code(code) => resolve_code(*code, &self.to_string()),
            Self::Definition(definition) => resolve_definition(definition),
        }
    }
}

fn resolve_code(code: u32, original: &str) -> Result<Crs> {
    let code = u16::try_from(code).map_err(|_| Error::UnknownCrs(original.to_owned()))?;
    match epsg_to_proj_string(code) {
        Some(_) => Ok(Crs::Epsg(code)),
        None => Err(Error::UnknownCrs(original.to_owned())),
    }
}

fn resolve_definition(definition: &str) -> Result<Crs> {
    let text = definition.trim();
    if text.starts_with("+proj=") {
        Proj::from_proj_string(text).map_err(|e| Error::UnknownCrs(format!("{text}: {e:?}")))?;
        return Ok(Crs::Proj4(text.to_owned()));
    }

    if let Ok(code) = text.parse::<u32>() {
        return resolve_code(code, definition);
    }

    let authority = Regex::new(r"(?i)^epsg:(\d+)$").map_err(|e| Error::UnknownCrs(e.to_string()))?;
    if let Some(captures) = authority.captures(text) {
        let code = captures[1].parse().map_err(|_| Error::UnknownCrs(definition.to_owned()))?;
        return resolve_code(code, definition);
    }

    // A misspelled authority prefix still carries a usable code after the colon.
    if let Some((prefix, code)) = text.split_once(':') {
        if let Ok(code) = code.trim().parse::<u32>() {
            warn!("Unrecognised CRS authority '{prefix}' in '{definition}', trying EPSG:{code}");
            return resolve_code(code, definition);
        }
    }

    Err(Error::UnknownCrs(definition.to_owned()))
}

/// Transforms points between two CRSs, in degrees for geographic ones.
pub struct CoordTransformer {
    source_proj: Proj,
    target_proj: Proj,
    source_is_geographic: bool,
    target_is_geographic: bool,
    identity: bool,
}

impl CoordTransformer {
    pub fn new(source: &Crs, target: &Crs) -> Result<Self> {
        let source_str = source.proj4_string()?;
        let target_str = target.proj4_string()?;

        let source_proj = Proj::from_proj_string(source_str)
            .map_err(|e| Error::Projection(format!("Invalid source projection {source}: {e:?}")))?;
        let target_proj = Proj::from_proj_string(target_str)
            .map_err(|e| Error::Projection(format!("Invalid target projection {target}: {e:?}")))?;

        Ok(Self {
            source_proj,
            target_proj,
            source_is_geographic: is_longlat(source_str),
            target_is_geographic: is_longlat(target_str),
            identity: source == target,
        })
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if self.identity {
            return Ok((x, y));
        }

        // proj4rs works in radians for geographic coordinates
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source_proj, &self.target_proj, &mut point)
            .map_err(|e| Error::Projection(format!("Transform of ({x}, {y}) failed: {e:?}")))?;

        if self.target_is_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_accepts_common_spellings_of_an_epsg_code() {
        for spec in [
            CrsSpec::Code(5070),
            CrsSpec::from("5070"),
            CrsSpec::from("EPSG:5070"),
            CrsSpec::from(" epsg:5070 "),
            CrsSpec::from("ESPGG:5070"),
        ] {
            assert_eq!(spec.resolve().unwrap(), Crs::Epsg(5070), "{spec}");
        }
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        for spec in [
            CrsSpec::Code(99999),
            CrsSpec::Code(1),
            CrsSpec::from("EPSG:abc"),
            CrsSpec::from("not a crs"),
            CrsSpec::from("+proj=nonsense"),
        ] {
            assert!(matches!(spec.resolve(), Err(Error::UnknownCrs(_))), "{spec}");
        }
    }

    #[test]
    fn test_proj4_definitions_are_kept_verbatim() {
        let definition = "+proj=utm +zone=10 +datum=WGS84 +units=m +no_defs";
        assert_eq!(
            CrsSpec::from(definition).resolve().unwrap(),
            Crs::Proj4(definition.to_string())
        );
    }

    #[test]
    fn test_geographic_detection() {
        assert!(Crs::Epsg(4326).is_geographic());
        assert!(!Crs::Epsg(32610).is_geographic());
        assert!(!Crs::Epsg(5070).is_geographic());
    }

    #[test]
    fn test_utm_to_wgs84() {
        let transformer = CoordTransformer::new(&Crs::Epsg(32610), &Crs::Epsg(4326)).unwrap();
        // Central meridian of zone 10 on the equator.
        let (lon, lat) = transformer.transform(500_000.0, 0.0).unwrap();
        assert!((lon - -123.0).abs() < EPS, "lon = {lon}");
        assert!(lat.abs() < EPS, "lat = {lat}");
    }

    #[test]
    fn test_wgs84_to_albers_origin() {
        let transformer = CoordTransformer::new(&Crs::Epsg(4326), &Crs::Epsg(5070)).unwrap();
        // EPSG:5070 is centred on 96W, 23N with no false easting/northing.
        let (x, y) = transformer.transform(-96.0, 23.0).unwrap();
        assert!(x.abs() < 0.01, "x = {x}");
        assert!(y.abs() < 0.01, "y = {y}");
    }

    #[test]
    fn test_identity_transform() {
        let transformer = CoordTransformer::new(&Crs::Epsg(5070), &Crs::Epsg(5070)).unwrap();
        assert_eq!(transformer.transform(12.5, -3.0).unwrap(), (12.5, -3.0));
    }
}
