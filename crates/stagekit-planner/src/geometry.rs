//! # Scan Geometry
//!
//! Turns a requested area, a field of view and a fractional overlap into an
//! ordered grid of stage positions.
//!
//! Supports:
//! - Two-corner rectangles with an optional border
//! - Three-corner skewed grids (lower-left, upper-left, lower-right) with
//!   optional Z interpolation
//! - Serpentine or raster traversal
//! - Exclusion zones that skip cells without changing the image count
//!
//! Every position addresses the leading (minimum) edge of the field of view:
//! image `i` along an axis covers `[start + i * step, start + i * step + fov]`.

use serde::{Deserialize, Serialize};
use stagekit_core::{Axis, AxisSet, ConfigurationError, Position, Result, ScanError};
use stagekit_settings::{ExclusionZone, ImagerSettings, ScanBounds, ScanSettings};

/// Relative slack under which an ideal count just above an integer rounds down
pub const COUNT_TOLERANCE: f64 = 0.01;

/// Smallest |sin θ| accepted between the column and row vectors of a skewed grid
pub const MIN_SKEW_SINE: f64 = 1e-3;

/// Fractional number of images needed to cover `span`
pub fn images_ideal(fov: f64, span: f64, overlap: f64) -> f64 {
    if span > fov {
        1.0 + (span - fov) / ((1.0 - overlap) * fov)
    } else {
        span / fov
    }
}

/// Whole number of images needed to cover `span`, never less than one
pub fn images_actual(fov: f64, span: f64, overlap: f64) -> usize {
    let ideal = images_ideal(fov, span, overlap);
    let floor = ideal.floor();
    let count = if floor >= 1.0 && ideal - floor <= COUNT_TOLERANCE * floor {
        floor
    } else {
        ideal.ceil()
    };
    (count as usize).max(1)
}

/// Distance between neighbouring image positions
pub fn step_size(fov: f64, span: f64, images: usize) -> f64 {
    if images <= 1 {
        span / images.max(1) as f64
    } else {
        (span - fov) / (images - 1) as f64
    }
}

/// Field of view of one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldOfView {
    /// Width in mm (along X / columns)
    pub width_mm: f64,
    /// Height in mm (along Y / rows)
    pub height_mm: f64,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
}

impl FieldOfView {
    /// Derive the height from the pixel aspect ratio
    pub fn from_pixels(width_mm: f64, (width_px, height_px): (u32, u32)) -> Result<Self> {
        if width_px == 0 || height_px == 0 || !(width_mm > 0.0) {
            return Err(ScanError::Degenerate {
                reason: format!(
                    "field of view {}mm over {}x{} pixels",
                    width_mm, width_px, height_px
                ),
            }
            .into());
        }
        Ok(Self {
            width_mm,
            height_mm: width_mm * height_px as f64 / width_px as f64,
            width_px,
            height_px,
        })
    }

    /// Field of view of the configured sensor
    pub fn from_settings(imager: &ImagerSettings) -> Result<Self> {
        Self::from_pixels(imager.view_x_mm, (imager.width_px, imager.height_px))
    }
}

/// Per-axis scan geometry, embedded verbatim in scan metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDescriptor {
    /// Stage axis
    pub axis: Axis,
    /// Field of view along the axis in mm
    pub view_mm: f64,
    /// Field of view along the axis in pixels
    pub view_px: u32,
    /// Requested start (leading edge of the first image)
    pub start: f64,
    /// Requested end (trailing edge of the last image)
    pub end: f64,
    /// Fractional image count
    pub images_ideal: f64,
    /// Whole image count
    pub images_actual: usize,
    /// Distance between neighbouring images
    pub step: f64,
    /// Trailing edge actually covered; beyond `end` when the span is shorter
    /// than one field of view
    pub actual_end: f64,
}

impl AxisDescriptor {
    /// Plan one axis covering `[start, end]`
    pub fn new(axis: Axis, view_mm: f64, view_px: u32, start: f64, end: f64, overlap: f64) -> Self {
        let span = (end - start).max(0.0);
        let images_ideal = images_ideal(view_mm, span, overlap);
        let images_actual = images_actual(view_mm, span, overlap);
        let step = step_size(view_mm, span, images_actual);
        let actual_end = if images_actual > 1 {
            start + (images_actual - 1) as f64 * step + view_mm
        } else {
            start + view_mm.max(span)
        };
        Self {
            axis,
            view_mm,
            view_px,
            start,
            end,
            images_ideal,
            images_actual,
            step,
            actual_end,
        }
    }

    /// Requested span
    pub fn span(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Leading edge of image `index`
    pub fn position(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }
}

/// One cell of the grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    /// Row index (along Y)
    pub row: usize,
    /// Column index (along X)
    pub col: usize,
    /// Stage target; X and Y always, Z only when tracked
    pub position: Position,
}

/// Planned grid of image positions
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGeometry {
    columns: AxisDescriptor,
    rows: AxisDescriptor,
    origin: Position,
    per_col: Position,
    per_row: Position,
    tracks_z: bool,
    serpentine: bool,
    exclusions: Vec<ExclusionZone>,
}

impl ScanGeometry {
    /// Plan the scan described by the settings
    pub fn from_settings(scan: &ScanSettings, fov: &FieldOfView) -> Result<Self> {
        check_overlap(scan.overlap)?;
        let geometry = match &scan.bounds {
            ScanBounds::Contour { start, end } => {
                Self::contour(start, end, fov, scan.overlap, scan.border)?
            }
            ScanBounds::ThreeCorner { ll, ul, lr } => {
                Self::three_corner(ll, ul, lr, fov, scan.overlap)?
            }
        };
        Ok(geometry
            .with_serpentine(scan.serpentine)
            .with_exclusions(scan.exclusions.clone()))
    }

    /// Rectangle between two opposite corners, grown by `border` on every side
    pub fn contour(
        start: &Position,
        end: &Position,
        fov: &FieldOfView,
        overlap: f64,
        border: f64,
    ) -> Result<Self> {
        check_overlap(overlap)?;
        let (x0, y0) = xy(start, "scan.bounds.start")?;
        let (x1, y1) = xy(end, "scan.bounds.end")?;

        let columns = AxisDescriptor::new(
            Axis::X,
            fov.width_mm,
            fov.width_px,
            x0.min(x1) - border,
            x0.max(x1) + border,
            overlap,
        );
        let rows = AxisDescriptor::new(
            Axis::Y,
            fov.height_mm,
            fov.height_px,
            y0.min(y1) - border,
            y0.max(y1) + border,
            overlap,
        );

        Ok(Self {
            origin: Position::xy(columns.start, rows.start),
            per_col: Position::xy(columns.step, 0.0),
            per_row: Position::xy(0.0, rows.step),
            columns,
            rows,
            tracks_z: false,
            serpentine: true,
            exclusions: Vec::new(),
        })
    }

    /// Skewed grid through three reference image positions
    ///
    /// Columns run from `ll` to `lr` and rows from `ll` to `ul`. Z is
    /// interpolated only when all three corners carry it.
    pub fn three_corner(
        ll: &Position,
        ul: &Position,
        lr: &Position,
        fov: &FieldOfView,
        overlap: f64,
    ) -> Result<Self> {
        check_overlap(overlap)?;
        let (llx, lly) = xy(ll, "scan.bounds.ll")?;
        let (ulx, uly) = xy(ul, "scan.bounds.ul")?;
        let (lrx, lry) = xy(lr, "scan.bounds.lr")?;

        let col_vec = (lrx - llx, lry - lly);
        let row_vec = (ulx - llx, uly - lly);
        let col_len = col_vec.0.hypot(col_vec.1);
        let row_len = row_vec.0.hypot(row_vec.1);

        // Corners are image positions, so the covered span adds one view
        let columns = AxisDescriptor::new(
            Axis::X,
            fov.width_mm,
            fov.width_px,
            llx,
            llx + col_len + fov.width_mm,
            overlap,
        );
        let rows = AxisDescriptor::new(
            Axis::Y,
            fov.height_mm,
            fov.height_px,
            lly,
            lly + row_len + fov.height_mm,
            overlap,
        );
        let cols_n = columns.images_actual;
        let rows_n = rows.images_actual;

        if cols_n > 1 && rows_n > 1 {
            let sine = (col_vec.0 * row_vec.1 - col_vec.1 * row_vec.0).abs() / (col_len * row_len);
            if !(sine >= MIN_SKEW_SINE) {
                return Err(ConfigurationError::invalid(
                    "scan.bounds",
                    format!(
                        "corners are nearly collinear (|sin θ| = {:.2e}); rows and columns would overlap",
                        sine
                    ),
                )
                .into());
            }
        }

        let tracks_z = ll.contains(Axis::Z) && ul.contains(Axis::Z) && lr.contains(Axis::Z);
        let planar: AxisSet = [Axis::X, Axis::Y, Axis::Z]
            .into_iter()
            .filter(|axis| tracks_z || *axis != Axis::Z)
            .collect();
        let per = |from: &Position, to: &Position, count: usize| -> Position {
            if count <= 1 {
                return Position::new();
            }
            to.delta_from(from)
                .restricted_to(&planar)
                .map_values(|_, v| v / (count - 1) as f64)
        };

        let mut origin = Position::xy(llx, lly);
        if tracks_z {
            if let Some(z) = ll.get(Axis::Z) {
                origin.set(Axis::Z, z);
            }
        }

        Ok(Self {
            per_col: per(ll, lr, cols_n),
            per_row: per(ll, ul, rows_n),
            origin,
            columns,
            rows,
            tracks_z,
            serpentine: true,
            exclusions: Vec::new(),
        })
    }

    /// Select serpentine (true) or raster (false) order
    pub fn with_serpentine(mut self, serpentine: bool) -> Self {
        self.serpentine = serpentine;
        self
    }

    /// Skip the cells inside these zones
    pub fn with_exclusions(mut self, exclusions: Vec<ExclusionZone>) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Column axis descriptor
    pub fn columns(&self) -> &AxisDescriptor {
        &self.columns
    }

    /// Row axis descriptor
    pub fn rows(&self) -> &AxisDescriptor {
        &self.rows
    }

    /// Both descriptors, columns first
    pub fn descriptors(&self) -> Vec<AxisDescriptor> {
        vec![self.columns.clone(), self.rows.clone()]
    }

    /// Whether Z is interpolated from the corners
    pub fn tracks_z(&self) -> bool {
        self.tracks_z
    }

    /// Whether any exclusion zone is configured
    pub fn has_exclusions(&self) -> bool {
        !self.exclusions.is_empty()
    }

    /// Grid size including excluded cells
    pub fn images_expected(&self) -> usize {
        self.columns.images_actual * self.rows.images_actual
    }

    /// Stage target of a cell
    pub fn position(&self, row: usize, col: usize) -> Position {
        self.origin
            .offset_by(&self.per_col.map_values(|_, v| col as f64 * v))
            .offset_by(&self.per_row.map_values(|_, v| row as f64 * v))
    }

    fn is_excluded(&self, row: usize, col: usize) -> bool {
        self.exclusions.iter().any(|zone| zone.contains(row, col))
    }

    /// Ordered cells to visit
    pub fn points(&self) -> Vec<GridPoint> {
        let cols = self.columns.images_actual;
        let mut points = Vec::with_capacity(self.images_expected());
        for row in 0..self.rows.images_actual {
            let reversed = self.serpentine && row % 2 == 1;
            for i in 0..cols {
                let col = if reversed { cols - 1 - i } else { i };
                if self.is_excluded(row, col) {
                    continue;
                }
                points.push(GridPoint {
                    row,
                    col,
                    position: self.position(row, col),
                });
            }
        }
        points
    }
}

fn check_overlap(overlap: f64) -> Result<()> {
    if !(0.0..1.0).contains(&overlap) {
        return Err(ConfigurationError::invalid("scan.overlap", "must be in [0, 1)").into());
    }
    Ok(())
}

fn xy(position: &Position, key: &str) -> Result<(f64, f64)> {
    match (position.get(Axis::X), position.get(Axis::Y)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ConfigurationError::invalid(key, "must give both x and y").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fov() -> FieldOfView {
        FieldOfView::from_pixels(1.0, (150, 50)).unwrap()
    }

    #[test]
    fn test_counts_and_steps() {
        assert_eq!(images_actual(1.0, 2.0, 0.3), 3);
        assert!((step_size(1.0, 2.0, 3) - 0.5).abs() < 1e-12);
        assert_eq!(images_actual(1.0, 0.0, 0.3), 1);
        assert_eq!(images_actual(1.0, 0.4, 0.3), 1);
    }

    #[test]
    fn test_borderline_count_rounds_down() {
        // ideal = 1 + 2.005 / 1.0 = 3.005
        assert_eq!(images_actual(1.0, 3.005, 0.0), 3);
        assert_eq!(images_actual(1.0, 3.2, 0.0), 4);
    }

    #[test]
    fn test_short_span_expands_to_one_view() {
        let axis = AxisDescriptor::new(Axis::X, 1.0, 100, 5.0, 5.25, 0.3);
        assert_eq!(axis.images_actual, 1);
        assert!((axis.actual_end - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_reference_rectangle() {
        let geometry = ScanGeometry::contour(
            &Position::xy(0.0, 0.0),
            &Position::xy(2.0, 1.0),
            &fov(),
            0.3,
            0.0,
        )
        .unwrap();
        assert_eq!(geometry.columns().images_actual, 3);
        assert_eq!(geometry.rows().images_actual, 4);
        assert_eq!(geometry.points().len(), 12);
    }

    #[test]
    fn test_serpentine_and_raster_order() {
        let geometry = ScanGeometry::contour(
            &Position::xy(0.0, 0.0),
            &Position::xy(2.0, 1.0),
            &fov(),
            0.3,
            0.0,
        )
        .unwrap();
        let cols: Vec<usize> = geometry.points().iter().take(6).map(|p| p.col).collect();
        assert_eq!(cols, vec![0, 1, 2, 2, 1, 0]);

        let raster = geometry.with_serpentine(false);
        let cols: Vec<usize> = raster.points().iter().take(6).map(|p| p.col).collect();
        assert_eq!(cols, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_border_grows_rectangle() {
        let geometry = ScanGeometry::contour(
            &Position::xy(1.0, 1.0),
            &Position::xy(2.0, 2.0),
            &FieldOfView::from_pixels(1.0, (100, 100)).unwrap(),
            0.0,
            0.5,
        )
        .unwrap();
        assert_eq!(geometry.columns().start, 0.5);
        assert_eq!(geometry.columns().end, 2.5);
        assert_eq!(geometry.images_expected(), 4);
    }

    #[test]
    fn test_exclusions_keep_expected_count() {
        let geometry = ScanGeometry::contour(
            &Position::xy(0.0, 0.0),
            &Position::xy(2.0, 1.0),
            &fov(),
            0.3,
            0.0,
        )
        .unwrap()
        .with_exclusions(vec![ExclusionZone {
            row_min: 1,
            row_max: 2,
            col_min: 0,
            col_max: 0,
        }]);
        assert_eq!(geometry.images_expected(), 12);
        assert_eq!(geometry.points().len(), 10);
        assert!(geometry.has_exclusions());
    }

    #[test]
    fn test_three_corner_skew_and_z() {
        let square = FieldOfView::from_pixels(1.0, (100, 100)).unwrap();
        let ll = Position::xyz(0.0, 0.0, 1.0);
        let ul = Position::xyz(0.1, 2.0, 1.2);
        let lr = Position::xyz(2.0, 0.1, 0.8);
        let geometry = ScanGeometry::three_corner(&ll, &ul, &lr, &square, 0.0).unwrap();

        assert!(geometry.tracks_z());
        let cols = geometry.columns().images_actual;
        let rows = geometry.rows().images_actual;
        let far = geometry.position(rows - 1, cols - 1);
        assert!((far.get(Axis::X).unwrap() - 2.1).abs() < 1e-9);
        assert!((far.get(Axis::Y).unwrap() - 2.1).abs() < 1e-9);
        assert!((far.get(Axis::Z).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(geometry.position(0, 0), ll);
    }

    #[test]
    fn test_three_corner_without_z_leaves_z_alone() {
        let square = FieldOfView::from_pixels(1.0, (100, 100)).unwrap();
        let geometry = ScanGeometry::three_corner(
            &Position::xyz(0.0, 0.0, 1.0),
            &Position::xy(0.0, 2.0),
            &Position::xy(2.0, 0.0),
            &square,
            0.0,
        )
        .unwrap();
        assert!(!geometry.tracks_z());
        assert!(geometry.points().iter().all(|p| !p.position.contains(Axis::Z)));
    }

    #[test]
    fn test_collinear_corners_rejected() {
        let square = FieldOfView::from_pixels(1.0, (100, 100)).unwrap();
        let err = ScanGeometry::three_corner(
            &Position::xy(0.0, 0.0),
            &Position::xy(1.0, 1.0),
            &Position::xy(2.0, 2.0),
            &square,
            0.0,
        )
        .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_zero_pixels_is_degenerate() {
        assert!(matches!(
            FieldOfView::from_pixels(1.0, (0, 10)),
            Err(stagekit_core::Error::Scan(ScanError::Degenerate { .. }))
        ));
    }
}
