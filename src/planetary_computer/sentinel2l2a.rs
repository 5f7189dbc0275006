pub const COLLECTION: &str = "sentinel-2-l2a";

pub fn image_selection_toml() -> toml::Table {
    toml::toml! {
        id = "planetary_computer.sentinel2l2a"

        provider = "planetary_computer"

        name = "Sentinel-2 Level-2A"

        description = "Sentinel-2 Level-2A bottom-of-atmosphere reflectance,\n\
        processed with Sen2Cor and stored as Cloud Optimized GeoTIFFs on Azure.\n\
        Scenes are 100x100 km MGRS tiles with 10 m, 20 m and 60 m bands."

        docs = "https://planetarycomputer.microsoft.com/dataset/sentinel-2-l2a"

        collection = "sentinel-2-l2a"

        tile_ids = ["10SDJ"]

        max_cloud_cover = 15

        max_no_data = 5

        no_data_property = "s2:nodata_pixel_percentage"

        // EPSG:5070, NAD83 / Conus Albers
        target_crs = 5070

        output_dir = "./outputs"

        delete_intermediate = false

        page_limit = 100

        ids_to_download = []

        [period]
        start_year = 2020
        end_year = 2024
        start_month = 6
        end_month = 7

        [[products]]
        id = "B04"
        name = "Red"
        download = false

        [[products]]
        id = "B03"
        name = "Green"
        download = false

        [[products]]
        id = "B02"
        name = "Blue"
        download = false

        [[products]]
        id = "B08"
        name = "NIR"
        download = false

        [[products]]
        id = "visual"
        name = "True Color"
        download = true
    }
}
