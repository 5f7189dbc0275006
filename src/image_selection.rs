use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::date_range::{self, DateRange};
use crate::item::NO_DATA_PERCENTAGE;
use crate::pipeline::ProcessOptions;
use crate::projection::CrsSpec;
use crate::provider::ProviderKind;
use crate::search::DEFAULT_PAGE_LIMIT;

/// What to search for, which bands to fetch and where the results go.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ImageSelection {
    pub id: String,
    pub provider: ProviderKind,
    pub name: String,
    pub description: String,
    pub docs: String,
    pub collection: String,
    /// MGRS tiles searched by `search`.
    #[serde(default)]
    pub tile_ids: Vec<String>,
    pub max_cloud_cover: f64,
    #[serde(default = "default_max_no_data")]
    pub max_no_data: f64,
    #[serde(default = "default_no_data_property")]
    pub no_data_property: String,
    /// Reprojection is skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_crs: Option<CrsSpec>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub delete_intermediate: bool,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Products to process when no product list is given on the command line.
    #[serde(default)]
    pub ids_to_download: Vec<String>,
    pub period: Period,
    pub products: Vec<Product>,
}

/// Months `start_month..=end_month` of every year `start_year..=end_year`.
/// A window with `end_month < start_month` runs into the next year.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Period {
    pub start_year: i32,
    pub end_year: i32,
    pub start_month: u32,
    pub end_month: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Product {
    /// Asset key on the catalog item.
    pub id: String,
    pub name: String,
    pub download: bool,
}

fn default_max_no_data() -> f64 {
    5.0
}

fn default_no_data_property() -> String {
    NO_DATA_PERCENTAGE.to_string()
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl ImageSelection {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        let selection: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid image selection {}", path.display()))?;
        Ok(selection)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let selection: Self =
            toml::from_str(&table.to_string()).context("Error deserializing template")?;
        Ok(selection)
    }

    /// Asset keys marked for download, in file order. That order is the band
    /// order of the merged output.
    pub fn bands_to_download(&self) -> Option<Vec<String>> {
        let bands = self
            .products
            .iter()
            .filter(|p| p.download)
            .map(|p| p.id.clone())
            .collect::<Vec<_>>();
        if bands.is_empty() {
            return None;
        }
        Some(bands)
    }

    /// `ids_to_download` without duplicates, first occurrence kept.
    pub fn ids_to_download(&self) -> Option<Vec<String>> {
        if self.ids_to_download.is_empty() {
            return None;
        }
        let mut seen = HashSet::new();
        let ids = self
            .ids_to_download
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        Some(ids)
    }

    pub fn date_ranges(&self) -> crate::error::Result<Vec<DateRange>> {
        let Period {
            start_year,
            end_year,
            start_month,
            end_month,
        } = self.period;
        date_range::build_wrapping(start_year, end_year, start_month, end_month)
    }

    pub fn process_options(&self) -> Result<ProcessOptions> {
        let bands = self
            .bands_to_download()
            .ok_or(anyhow!("No products selected for download"))?;
        Ok(ProcessOptions {
            bands,
            destination_dir: self.output_dir.clone(),
            target_crs: self.target_crs.clone(),
            delete_intermediate: self.delete_intermediate,
        })
    }
}
