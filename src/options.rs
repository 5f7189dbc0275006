use clap::{Parser, Subcommand};
use slow_stac_scenes::provider::ProviderKind;
use std::path::PathBuf;

/// Search Sentinel-2 scenes on a STAC catalog, then download, merge and
/// reproject the best ones.
#[derive(Parser, Debug, Clone)]
pub struct Cli {
    /// Log at debug level, whatever GEO_LOG_LEVEL says.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Write a starter image selection file.
    Template {
        #[arg(short, long, value_enum, default_value_t = ProviderKind::PlanetaryComputer)]
        provider: ProviderKind,

        /// Where to write the TOML file.
        path: PathBuf,
    },

    /// Find the best product of every tile in the selection.
    Search {
        /// Image selection TOML file.
        selection: PathBuf,
    },

    /// Write the download plan of the given products without fetching anything.
    Plan {
        selection: PathBuf,

        /// Comma-separated product ids, or a .txt file with one id per line.
        #[arg(short, long)]
        products: Option<String>,
    },

    /// Download, merge and reproject products.
    Process {
        selection: PathBuf,

        /// Comma-separated product ids, or a .txt file with one id per line.
        /// Defaults to `ids_to_download` of the selection.
        #[arg(short, long)]
        products: Option<String>,

        /// Download again even when band files are already on disk.
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
}
