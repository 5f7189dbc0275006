mod provider;
pub use provider::PlanetaryComputer;
pub mod sentinel2l2a;

pub const API_ROOT: &str = "https://planetarycomputer.microsoft.com/api/stac/v1";
pub const SAS_ENDPOINT: &str = "https://planetarycomputer.microsoft.com/api/sas/v1/token";
