mod options;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::{info, LevelFilter};
use options::{Cli, Command as CliCmd};
use slow_stac_scenes::download_plan::{AssetDownloader, DownloadPlan};
use slow_stac_scenes::image_selection::ImageSelection;
use slow_stac_scenes::item::CatalogItem;
use slow_stac_scenes::pipeline::process_item;
use slow_stac_scenes::product_search::{parse_product_list, ProductSearch, PRODUCT_LIST};
use slow_stac_scenes::provider::Provider;
use slow_stac_scenes::stac_operations::{missing_ids, search_by_ids};
use slow_stac_scenes::transport::{HttpTransport, RetryTransport};
use std::path::Path;
use std::time::Duration;

const LOG_LEVEL_ENV: &str = "GEO_LOG_LEVEL";
const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = Builder::from_env(Env::default().filter_or(LOG_LEVEL_ENV, "info"));
    if cli.debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.format_timestamp_secs();
    builder.init();

    match cli.cmd {
        CliCmd::Template { provider, path } => {
            let selection = ImageSelection::from_template(&provider.image_selection_toml())?;
            selection.write(&path)?;
            info!("Template for {provider} written to {}", path.display());
        }
        CliCmd::Search { selection } => search(&selection).await?,
        CliCmd::Plan { selection, products } => plan(&selection, products.as_deref()).await?,
        CliCmd::Process {
            selection,
            products,
            overwrite,
        } => process(&selection, products.as_deref(), overwrite).await?,
    }
    Ok(())
}

fn connect(selection: &ImageSelection) -> Result<Provider> {
    let provider = selection
        .provider
        .connect(reqwest::Client::new())
        .with_context(|| format!("Could not set up the {} client", selection.provider))?;
    Ok(provider)
}

async fn search(selection_path: &Path) -> Result<()> {
    let selection = ImageSelection::read(selection_path)?;
    if selection.tile_ids.is_empty() {
        bail!("No tile_ids in {}", selection_path.display());
    }

    let search = ProductSearch::new(connect(&selection)?, &selection)?;
    let results = search.run(&selection.tile_ids).await;
    results.write(&selection.output_dir, selection.max_cloud_cover)?;
    results.write_product_list(&selection.output_dir.join(PRODUCT_LIST))?;

    if !results.errors.is_empty() {
        bail!("Search failed for {} tile(s): {:?}", results.errors.len(), results.errors);
    }
    Ok(())
}

/// Resolves the products to work on and fetches their catalog items.
async fn selected_items(
    provider: &Provider,
    selection: &ImageSelection,
    products: Option<&str>,
) -> Result<Vec<CatalogItem>> {
    let ids = match products {
        Some(products) => parse_product_list(products)?,
        None => selection.ids_to_download().unwrap_or_default(),
    };
    if ids.is_empty() {
        bail!("No products to process: pass --products or set ids_to_download");
    }

    let items = search_by_ids(provider, &selection.collection, &ids)
        .await
        .context("Product lookup failed")?;
    let missing = missing_ids(&ids, &items);
    if !missing.is_empty() {
        bail!("Product(s) not found in {}: {missing:?}", selection.collection);
    }
    info!("Found {} of {} product(s)", items.len(), ids.len());
    Ok(items)
}

async fn plan(selection_path: &Path, products: Option<&str>) -> Result<()> {
    let selection = ImageSelection::read(selection_path)?;
    let bands = selection
        .bands_to_download()
        .ok_or(anyhow!("No products selected for download"))?;
    let provider = connect(&selection)?;

    let mut tasks = vec![];
    for item in selected_items(&provider, &selection, products).await? {
        let plan = DownloadPlan::for_item(&item, &bands, &selection.output_dir)?;
        tasks.extend_from_slice(plan.tasks());
    }

    std::fs::create_dir_all(&selection.output_dir)?;
    let path = selection.output_dir.join("download_plan.json");
    DownloadPlan::new(tasks).write(&path)?;
    info!("Download plan written to {}", path.display());
    Ok(())
}

async fn process(selection_path: &Path, products: Option<&str>, overwrite: bool) -> Result<()> {
    let selection = ImageSelection::read(selection_path)?;
    let options = selection.process_options()?;
    let provider = connect(&selection)?;
    let items = selected_items(&provider, &selection, products).await?;

    let transport = RetryTransport::new(HttpTransport::default(), DOWNLOAD_ATTEMPTS, RETRY_BACKOFF);
    let downloader = AssetDownloader::new(transport).overwrite(overwrite);
    for item in &items {
        match process_item(&downloader, item, &options).await {
            Ok(processed) => info!("{}: {}", processed.item_id, processed.asset.path.display()),
            Err(failure) => {
                eprintln!("{} failed at stage '{}'", failure.item_id, failure.stage);
                return Err(failure.into());
            }
        }
    }
    Ok(())
}
