pub const COLLECTION: &str = "sentinel-2-c1-l2a";

pub fn image_selection_toml() -> toml::Table {
    toml::toml! {
        id = "element84.sentinel2collection1level2a"

        provider = "element84"

        name = "Sentinel-2 Collection 1 Level 2A Surface Reflectance"

        description = "Sentinel-2 Collection 1 Level-2A surface reflectance reprocessed by ESA\n\
        with a consistent processing baseline, published as Cloud Optimized GeoTIFFs on AWS.\n\
        Scenes are 100x100 km MGRS tiles; SCL carries the scene classification."

        docs = "https://registry.opendata.aws/sentinel-2-l2a-cogs/"

        collection = "sentinel-2-c1-l2a"

        tile_ids = ["08VPH"]

        max_cloud_cover = 15

        max_no_data = 5

        no_data_property = "s2:nodata_pixel_percentage"

        target_crs = "EPSG:3005"

        output_dir = "./outputs"

        delete_intermediate = false

        page_limit = 100

        ids_to_download = []

        [period]
        start_year = 2023
        end_year = 2024
        start_month = 5
        end_month = 8

        [[products]]
        id = "red"
        name = "Red"
        download = false

        [[products]]
        id = "green"
        name = "Green"
        download = false

        [[products]]
        id = "blue"
        name = "Blue"
        download = false

        [[products]]
        id = "nir"
        name = "NIR"
        download = false

        [[products]]
        id = "visual"
        name = "True Color"
        download = true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_selection::ImageSelection;
    use crate::projection::CrsSpec;
    use crate::provider::ProviderKind;

    #[test]
    fn test_template() {
        let selection = ImageSelection::from_template(&image_selection_toml()).unwrap();
        assert_eq!(selection.provider, ProviderKind::Element84);
        assert_eq!(selection.collection, COLLECTION);
        assert_eq!(selection.target_crs, Some(CrsSpec::from("EPSG:3005")));
        assert_eq!(selection.bands_to_download().unwrap(), vec!["visual"]);
        assert_eq!(selection.date_ranges().unwrap().len(), 2);
    }
}
