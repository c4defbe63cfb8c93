use super::{write_atomic, RasterBackend};
use crate::error::{Result, RichnessError};
use crate::raster::{PixelType, Raster, RasterMetadata};
use log::{debug, warn};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tiff::ColorType;

// GeoTIFF and GDAL private tags
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_NODATA: u16 = 42113;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

// GeoKey ids
const GT_RASTER_TYPE: u16 = 1025;
const GT_CITATION: u16 = 1026;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Pure-Rust single-band GeoTIFF storage (8 or 16-bit unsigned).
///
/// Georeferencing is kept in `ModelPixelScale`/`ModelTiepoint` and no-data in
/// `GDAL_NODATA`; GDAL reads both. The projection string is stored as the
/// `GTCitationGeoKey` citation. It round-trips through this backend but is
/// not a CRS definition other readers can resolve.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoTiffBackend;

impl GeoTiffBackend {
    pub fn new() -> Self {
        Self
    }
}

impl RasterBackend for GeoTiffBackend {
    fn describe(&self, path: &Path) -> Result<RasterMetadata> {
        let mut decoder = open_decoder(path)?;
        read_header(path, &mut decoder)
    }

    fn read(&self, path: &Path) -> Result<Raster> {
        debug!("Reading raster: {}", path.display());
        let mut decoder = open_decoder(path)?;
        let metadata = read_header(path, &mut decoder)?;

        let cells: Vec<u16> = match decoder.read_image()? {
            DecodingResult::U8(values) => values.into_iter().map(u16::from).collect(),
            DecodingResult::U16(values) => values,
            _ => {
                return Err(RichnessError::UnsupportedPixelType {
                    path: path.to_path_buf(),
                    detail: "expected 8 or 16-bit unsigned samples".to_string(),
                })
            }
        };

        if cells.len() != metadata.width * metadata.height {
            return Err(RichnessError::UnsupportedPixelType {
                path: path.to_path_buf(),
                detail: format!(
                    "{} samples for a {}x{} grid; only single-band rasters are supported",
                    cells.len(),
                    metadata.width,
                    metadata.height
                ),
            });
        }

        let data = Array2::from_shape_vec((metadata.height, metadata.width), cells)?;
        Raster::new(metadata, data)
    }

    fn write(&self, path: &Path, raster: &Raster) -> Result<()> {
        let metadata = &raster.metadata;
        debug!(
            "Writing {} raster {}x{}: {}",
            metadata.pixel_type,
            metadata.width,
            metadata.height,
            path.display()
        );

        let mut buffer = Cursor::new(Vec::new());
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
                encode::<colortype::Gray8, _>(&mut buffer, metadata, &cells)?;
            }
            PixelType::U16 => {
                let cells: Vec<u16> = raster.data.iter().copied().collect();
                encode::<colortype::Gray16, _>(&mut buffer, metadata, &cells)?;
            }
        }

        write_atomic(path, buffer.get_ref())?;
        Ok(())
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    Ok(decoder)
}

fn read_header<R: Read + Seek>(path: &Path, decoder: &mut Decoder<R>) -> Result<RasterMetadata> {
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(RichnessError::InvalidDimensions(width, height));
    }

    let pixel_type = match decoder.colortype()? {
        ColorType::Gray(8) => PixelType::U8,
        ColorType::Gray(16) => PixelType::U16,
        other => {
            return Err(RichnessError::UnsupportedPixelType {
                path: path.to_path_buf(),
                detail: format!("color type {:?}", other),
            })
        }
    };

    let scale = match decoder.find_tag(tag(MODEL_PIXEL_SCALE))? {
        Some(value) => Some(value.into_f64_vec()?),
        None => None,
    };
    let tiepoint = match decoder.find_tag(tag(MODEL_TIEPOINT))? {
        Some(value) => Some(value.into_f64_vec()?),
        None => None,
    };
    let geotransform = match (scale.as_deref(), tiepoint.as_deref()) {
        (Some([sx, sy, ..]), Some([i, j, _, x, y, ..])) => {
            [x - i * sx, *sx, 0.0, y + j * sy, 0.0, -sy]
        }
        _ => {
            debug!("No georeferencing in {}, using pixel coordinates", path.display());
            [0.0, 1.0, 0.0, 0.0, 0.0, -1.0]
        }
    };

    let nodata = match decoder.find_tag(tag(GDAL_NODATA))? {
        Some(value) => {
            let text = value.into_string()?;
            let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
            match text.parse::<f64>() {
                Ok(nd) => Some(nd),
                Err(_) => {
                    warn!("Ignoring unparseable GDAL_NODATA '{}' in {}", text, path.display());
                    None
                }
            }
        }
        None => None,
    };

    let projection = match decoder.find_tag(tag(GEO_ASCII_PARAMS))? {
        Some(value) => value
            .into_string()?
            .trim_end_matches(|c: char| c == '|' || c == '\0')
            .to_string(),
        None => String::new(),
    };

    Ok(RasterMetadata {
        width,
        height,
        geotransform,
        projection,
        nodata,
        pixel_type,
    })
}

fn encode<C, W>(writer: W, metadata: &RasterMetadata, cells: &[C::Inner]) -> Result<()>
where
    C: colortype::ColorType,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let gt = &metadata.geotransform;
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<C>(metadata.width as u32, metadata.height as u32)?;

    let directory = image.encoder();
    directory.write_tag(tag(MODEL_PIXEL_SCALE), &[gt[1], -gt[5], 0.0][..])?;
    directory.write_tag(tag(MODEL_TIEPOINT), &[0.0, 0.0, 0.0, gt[0], gt[3], 0.0][..])?;
    if let Some(nodata) = metadata.nodata {
        directory.write_tag(tag(GDAL_NODATA), format_nodata(nodata).as_str())?;
    }
    directory.write_tag(tag(GEO_KEY_DIRECTORY), &geo_key_directory(&metadata.projection)[..])?;
    if !metadata.projection.is_empty() {
        directory.write_tag(tag(GEO_ASCII_PARAMS), format!("{}|", metadata.projection).as_str())?;
    }

    image.write_data(cells)?;
    Ok(())
}

/// Header plus raster type and, when there is a projection string, a
/// citation pointing into `GeoAsciiParams`. Keys are sorted by id.
fn geo_key_directory(projection: &str) -> Vec<u16> {
    let mut keys = vec![[GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]];
    if !projection.is_empty() {
        let count = u16::try_from(projection.len() + 1).unwrap_or(u16::MAX);
        keys.push([GT_CITATION, GEO_ASCII_PARAMS, count, 0]);
    }

    let mut directory = vec![1, 1, 0, keys.len() as u16];
    directory.extend(keys.into_iter().flatten());
    directory
}

/// GDAL writes integral no-data values without a decimal point.
fn format_nodata(nodata: f64) -> String {
    if nodata.fract() == 0.0 && nodata.abs() < 1e15 {
        format!("{}", nodata as i64)
    } else {
        nodata.to_string()
    }
}
