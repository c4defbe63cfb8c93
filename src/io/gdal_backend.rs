use super::{partial_path, RasterBackend};
use crate::error::{Result, RichnessError};
use crate::raster::{PixelType, Raster, RasterMetadata};
use gdal::raster::{Buffer, GdalDataType, RasterBand};
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use ndarray::Array2;
use std::fs;
use std::path::Path;

/// GDAL-backed raster storage. Reads anything GDAL can open; writes GeoTIFF.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalBackend;

impl GdalBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Extract metadata from a dataset without reading all data
fn extract_metadata_from_dataset(path: &Path, dataset: &Dataset) -> Result<RasterMetadata> {
    let rasterband: RasterBand = dataset.rasterband(1)?;

    let width = rasterband.x_size();
    let height = rasterband.y_size();

    if width == 0 || height == 0 {
        return Err(RichnessError::InvalidDimensions(width, height));
    }

    let pixel_type = match rasterband.band_type() {
        GdalDataType::UInt8 => PixelType::U8,
        GdalDataType::UInt16 => PixelType::U16,
        other => {
            return Err(RichnessError::UnsupportedPixelType {
                path: path.to_path_buf(),
                detail: format!("band type {:?}", other),
            })
        }
    };

    let geotransform = dataset.geo_transform()?;
    if geotransform[1] <= 0.0 {
        return Err(RichnessError::InvalidPixelSize(geotransform[1]));
    }

    Ok(RasterMetadata {
        width,
        height,
        geotransform,
        projection: dataset.projection(),
        nodata: rasterband.no_data_value(),
        pixel_type,
    })
}

impl RasterBackend for GdalBackend {
    fn describe(&self, path: &Path) -> Result<RasterMetadata> {
        let dataset = Dataset::open(path)?;
        extract_metadata_from_dataset(path, &dataset)
    }

    fn read(&self, path: &Path) -> Result<Raster> {
        debug!("Opening raster: {}", path.display());
        let dataset = Dataset::open(path)?;
        let metadata = extract_metadata_from_dataset(path, &dataset)?;
        let rasterband = dataset.rasterband(1)?;

        let (width, height) = (metadata.width, metadata.height);
        let buffer = rasterband.read_as::<u16>((0, 0), (width, height), (width, height), None)?;
        // Buffer implements IntoIterator, so we can collect into a Vec
        let cells: Vec<u16> = buffer.into_iter().collect();
        let data = Array2::from_shape_vec((height, width), cells)?;

        Raster::new(metadata, data)
    }

    fn write(&self, path: &Path, raster: &Raster) -> Result<()> {
        let metadata = &raster.metadata;
        let (width, height) = (metadata.width, metadata.height);
        let tmp = partial_path(path);

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        {
            let mut dataset = match metadata.pixel_type {
                PixelType::U8 => driver.create_with_band_type::<u8, _>(&tmp, width, height, 1)?,
                PixelType::U16 => driver.create_with_band_type::<u16, _>(&tmp, width, height, 1)?,
            };

            dataset.set_geo_transform(&metadata.geotransform)?;
            if !metadata.projection.is_empty() {
                dataset.set_projection(&metadata.projection)?;
            }

            let mut band = dataset.rasterband(1)?;
            // GDAL expects data in row-major order (which is how Array2 stores it)
            match metadata.pixel_type {
                PixelType::U8 => {
                    let cells = raster
                        .data
                        .iter()
                        .map(|&value| {
                            u8::try_from(value).map_err(|_| RichnessError::ValueOutOfRange {
                                value,
                                pixel_type: PixelType::U8.name(),
                            })
                        })
                        .collect::<Result<Vec<u8>>>()?;
                    let mut buffer = Buffer::new((width, height), cells);
                    band.write((0, 0), (width, height), &mut buffer)?;
                }
                PixelType::U16 => {
                    let cells: Vec<u16> = raster.data.iter().copied().collect();
                    let mut buffer = Buffer::new((width, height), cells);
                    band.write((0, 0), (width, height), &mut buffer)?;
                }
            }
            band.set_no_data_value(metadata.nodata)?;
        }

        fs::rename(&tmp, path)?;
        info!("Wrote {} raster to {}", metadata.pixel_type, path.display());
        Ok(())
    }
}
