//! In-memory rasters and the grid arithmetic used to line them up.

use crate::error::{Result, RichnessError};
use ndarray::Array2;
use std::fmt;

/// Origins closer than this (in cells) to a whole-cell offset count as aligned.
const ALIGN_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
}

impl PixelType {
    pub fn max_value(self) -> u16 {
        match self {
            PixelType::U8 => u8::MAX as u16,
            PixelType::U16 => u16::MAX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub geotransform: [f64; 6],
    pub projection: String,
    pub nodata: Option<f64>,
    pub pixel_type: PixelType,
}

impl RasterMetadata {
    pub fn pixel_width(&self) -> f64 {
        self.geotransform[1].abs()
    }

    pub fn grid(&self) -> Result<Grid> {
        Grid::from_geotransform(&self.geotransform, self.width, self.height)
    }
}

/// A north-up raster grid: origin is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub origin_x: f64,
    pub origin_y: f64,
    pub cell_width: f64,
    pub cell_height: f64,
    pub width: usize,
    pub height: usize,
}

impl Grid {
    pub fn from_geotransform(geotransform: &[f64; 6], width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RichnessError::InvalidDimensions(width, height));
        }
        if geotransform[2] != 0.0 || geotransform[4] != 0.0 {
            return Err(RichnessError::GridMismatch(
                "rotated geotransforms are not supported".to_string(),
            ));
        }
        if geotransform[1] <= 0.0 {
            return Err(RichnessError::InvalidPixelSize(geotransform[1]));
        }
        if geotransform[5] >= 0.0 {
            return Err(RichnessError::GridMismatch(format!(
                "expected a north-up raster, got pixel height {}",
                geotransform[5]
            )));
        }

        Ok(Self {
            origin_x: geotransform[0],
            origin_y: geotransform[3],
            cell_width: geotransform[1],
            cell_height: -geotransform[5],
            width,
            height,
        })
    }

    pub fn geotransform(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.cell_width,
            0.0,
            self.origin_y,
            0.0,
            -self.cell_height,
        ]
    }

    fn check_cell_size(&self, other: &Grid) -> Result<()> {
        let dw = (self.cell_width - other.cell_width).abs() / self.cell_width;
        let dh = (self.cell_height - other.cell_height).abs() / self.cell_height;
        if dw > ALIGN_TOLERANCE || dh > ALIGN_TOLERANCE {
            return Err(RichnessError::GridMismatch(format!(
                "cell size {}x{} differs from {}x{}",
                other.cell_width, other.cell_height, self.cell_width, self.cell_height
            )));
        }
        Ok(())
    }

    /// Column and row of `other`'s top-left cell, relative to ours. May be negative.
    fn cell_offset(&self, other: &Grid) -> Result<(isize, isize)> {
        self.check_cell_size(other)?;
        let col = whole_cells(other.origin_x - self.origin_x, self.cell_width)?;
        let row = whole_cells(self.origin_y - other.origin_y, self.cell_height)?;
        Ok((row, col))
    }

    /// Smallest grid covering both extents (ArcGIS `MAXOF`).
    pub fn union(&self, other: &Grid) -> Result<Grid> {
        let (row, col) = self.cell_offset(other)?;

        let left = col.min(0);
        let top = row.min(0);
        let right = (self.width as isize).max(col + other.width as isize);
        let bottom = (self.height as isize).max(row + other.height as isize);

        Ok(Grid {
            origin_x: self.origin_x + left as f64 * self.cell_width,
            origin_y: self.origin_y - top as f64 * self.cell_height,
            cell_width: self.cell_width,
            cell_height: self.cell_height,
            width: (right - left) as usize,
            height: (bottom - top) as usize,
        })
    }

    /// Row and column where `other` starts inside this grid. `other` must fit entirely.
    pub fn placement(&self, other: &Grid) -> Result<(usize, usize)> {
        let (row, col) = self.cell_offset(other)?;
        if row < 0
            || col < 0
            || row as usize + other.height > self.height
            || col as usize + other.width > self.width
        {
            return Err(RichnessError::GridMismatch(format!(
                "{}x{} raster at offset ({}, {}) falls outside the {}x{} target grid",
                other.width, other.height, row, col, self.width, self.height
            )));
        }
        Ok((row as usize, col as usize))
    }
}

fn whole_cells(distance: f64, cell_size: f64) -> Result<isize> {
    let cells = distance / cell_size;
    let rounded = cells.round();
    if (cells - rounded).abs() > ALIGN_TOLERANCE {
        return Err(RichnessError::GridMismatch(format!(
            "origins are {:.6} cells apart; rasters are not snapped to a common grid",
            cells
        )));
    }
    Ok(rounded as isize)
}

/// Single-band raster held in memory. Cells are widened to `u16`; the
/// on-disk encoding is carried by `metadata.pixel_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub metadata: RasterMetadata,
    pub data: Array2<u16>,
}

impl Raster {
    pub fn new(metadata: RasterMetadata, data: Array2<u16>) -> Result<Self> {
        let (rows, cols) = data.dim();
        if rows != metadata.height || cols != metadata.width {
            return Err(RichnessError::InvalidDimensions(cols, rows));
        }
        if rows == 0 || cols == 0 {
            return Err(RichnessError::InvalidDimensions(cols, rows));
        }
        Ok(Self { metadata, data })
    }

    pub fn is_nodata(&self, value: u16) -> bool {
        self.metadata
            .nodata
            .map_or(false, |nd| f64::from(value) == nd)
    }

    /// Largest valid cell value, or `None` if every cell is no-data.
    pub fn max_value(&self) -> Option<u16> {
        self.data
            .iter()
            .copied()
            .filter(|&v| !self.is_nodata(v))
            .max()
    }

    pub fn valid_cells(&self) -> usize {
        self.data.iter().filter(|&&v| !self.is_nodata(v)).count()
    }

    /// Re-encode as 8-bit with no-data 0: the encoding used for staged
    /// habitat rasters. Source no-data cells become 0.
    pub fn to_presence_encoding(&self) -> Result<Raster> {
        let mut data = Array2::<u16>::zeros(self.data.dim());
        for (out, &value) in data.iter_mut().zip(self.data.iter()) {
            if self.is_nodata(value) {
                continue;
            }
            if value > PixelType::U8.max_value() {
                return Err(RichnessError::ValueOutOfRange {
                    value,
                    pixel_type: PixelType::U8.name(),
                });
            }
            *out = value;
        }

        let metadata = RasterMetadata {
            nodata: Some(0.0),
            pixel_type: PixelType::U8,
            ..self.metadata.clone()
        };
        Raster::new(metadata, data)
    }

    /// Binary presence mask: 1 where a valid cell satisfies `predicate`,
    /// no-data (0) everywhere else.
    pub fn map_cells<F>(&self, predicate: F) -> Raster
    where
        F: Fn(u16) -> bool,
    {
        let data = self
            .data
            .map(|&v| u16::from(!self.is_nodata(v) && predicate(v)));

        Raster {
            metadata: RasterMetadata {
                nodata: Some(0.0),
                pixel_type: PixelType::U8,
                ..self.metadata.clone()
            },
            data,
        }
    }
}
