use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use url::Url;

use crate::asset::{href_extension, partial_path, LocalAsset};
use crate::error::{Error, Result};
use crate::item::CatalogItem;
use crate::transport::{Transport, TransportError};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub item_id: String,
    pub band: String,
    pub href: String,
    pub output: PathBuf,
}

impl DownloadTask {
    fn local_asset(&self) -> LocalAsset {
        LocalAsset {
            item_id: self.item_id.clone(),
            kind: crate::asset::AssetKind::Band(self.band.clone()),
            path: self.output.clone(),
        }
    }
}

/// The transfers needed to fetch a set of bands, in the caller's band order.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct DownloadPlan {
    tasks: Vec<DownloadTask>,
}

impl DownloadPlan {
    pub fn new(tasks: Vec<DownloadTask>) -> Self {
        Self { tasks }
    }

    /// Fails with [`Error::AssetNotFound`] before planning anything if one of
    /// `bands` is not an asset of `item`. A band listed twice is planned once.
    pub fn for_item(item: &CatalogItem, bands: &[String], dir: &Path) -> Result<Self> {
        let mut tasks: Vec<DownloadTask> = Vec::with_capacity(bands.len());
        for band in bands {
            if tasks.iter().any(|task| &task.band == band) {
                debug!("Band {band} of {} is already planned", item.id);
                continue;
            }
            let href = item.asset_href(band).ok_or_else(|| Error::AssetNotFound {
                item_id: item.id.clone(),
                band: band.clone(),
            })?;
            let output = LocalAsset::band(&item.id, band, dir, href_extension(href)).path;
            tasks.push(DownloadTask {
                item_id: item.id.clone(),
                band: band.clone(),
                href: href.to_owned(),
                output,
            });
        }
        Ok(Self { tasks })
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Runs every task in order, stopping at the first failure.
    pub async fn execute(
        &self,
        transport: &impl Transport,
        overwrite: bool,
    ) -> Result<BTreeMap<String, LocalAsset>> {
        let mut downloaded = BTreeMap::new();
        for task in &self.tasks {
            debug!("Current task: {task:?}");
            try_download(transport, task, overwrite).await.map_err(|source| Error::Download {
                item_id: task.item_id.clone(),
                band: task.band.clone(),
                source,
            })?;
            downloaded.insert(task.band.clone(), task.local_asset());
        }
        Ok(downloaded)
    }
}

/// Fetches one task's href into its output path. An existing output is kept
/// unless `overwrite` is set. Bytes land in `<output>.part`, renamed once
/// complete; a failed transfer leaves the `.part` file behind.
pub async fn try_download(
    transport: &impl Transport,
    task: &DownloadTask,
    overwrite: bool,
) -> std::result::Result<(), TransportError> {
    let dst = task.output.as_path();
    if dst.exists() && !overwrite {
        info!("{} already exists, skipping download", dst.display());
        return Ok(());
    }

    if let Some(parent_dir) = dst.parent() {
        fs::create_dir_all(parent_dir)?;
    }

    let url = Url::parse(&task.href)?;
    let part = partial_path(dst);
    let mut file = File::create(&part)?;
    info!("Downloading {} of {} to {}", task.band, task.item_id, dst.display());
    let bytes = transport.fetch_to(&url, &mut file).await?;
    file.sync_all()?;
    fs::rename(&part, dst)?;
    info!("Download complete: {} ({bytes} bytes)", dst.display());
    Ok(())
}

/// Downloads the requested bands of catalog items through a [`Transport`].
pub struct AssetDownloader<T> {
    transport: T,
    overwrite: bool,
}

impl<T: Transport> AssetDownloader<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn download(
        &self,
        item: &CatalogItem,
        bands: &[String],
        dir: &Path,
    ) -> Result<BTreeMap<String, LocalAsset>> {
        let plan = DownloadPlan::for_item(item, bands, dir)?;
        plan.execute(&self.transport, self.overwrite).await
    }
}
