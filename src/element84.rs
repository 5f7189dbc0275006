mod provider;
pub use provider::EarthSearch;
pub mod sentinel2collection1level2a;

pub const API_ROOT: &str = "https://earth-search.aws.element84.com/v1";
