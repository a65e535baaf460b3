//! Fixed lat/lon grid used by publishers to shard the fleet into cells.
//!
//! Cell keys are `"<latIndex>,<lonIndex>"` counted from the south-west
//! corner of the grid bounds. Indices truncate toward zero and are not
//! clamped, so a vehicle outside the bounds still gets a key (`"-1,5"`,
//! `"12,3"`) and is still published.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::record::VehicleRecord;
use crate::router::PartitionKey;

/// Rejected grid configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("empty {axis} range: min {min} is not below max {max}")]
    EmptyRange {
        axis: &'static str,
        min: f64,
        max: f64,
    },

    #[error("cell size must be positive, got {0}")]
    CellSize(f64),
}

/// Grid bounds and cell size, in degrees.
///
/// Deserialization goes through [`GridSpec::new`], so a loaded grid is
/// always valid. A grid built by hand with bad fields places nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridBounds")]
pub struct GridSpec {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,

    /// Cell edge in degrees (0.1 is roughly 11 km of latitude)
    pub cell_size: f64,
}

#[derive(Deserialize)]
struct GridBounds {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
    cell_size: f64,
}

impl TryFrom<GridBounds> for GridSpec {
    type Error = GridError;

    fn try_from(b: GridBounds) -> Result<Self, Self::Error> {
        GridSpec::new(b.lat_min, b.lat_max, b.lon_min, b.lon_max, b.cell_size)
    }
}

impl Default for GridSpec {
    /// The Ottawa service area.
    fn default() -> Self {
        Self {
            lat_min: 45.0,
            lat_max: 46.0,
            lon_min: -76.0,
            lon_max: -75.0,
            cell_size: 0.1,
        }
    }
}

/// A fleet snapshot split by grid cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitioned {
    /// Records per cell, input order preserved within a cell
    pub cells: BTreeMap<PartitionKey, Vec<VehicleRecord>>,

    /// Records with no computable cell (non-finite position or unusable grid)
    pub unplaced: Vec<VehicleRecord>,
}

impl GridSpec {
    /// Creates a grid, rejecting bounds and cell sizes that cannot index cells.
    pub fn new(
        lat_min: f64,
        lat_max: f64,
        lon_min: f64,
        lon_max: f64,
        cell_size: f64,
    ) -> Result<Self, GridError> {
        let grid = Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
            cell_size,
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Checks that the bounds are finite and non-empty and the cell size positive.
    pub fn validate(&self) -> Result<(), GridError> {
        for (field, value) in [
            ("lat_min", self.lat_min),
            ("lat_max", self.lat_max),
            ("lon_min", self.lon_min),
            ("lon_max", self.lon_max),
            ("cell_size", self.cell_size),
        ] {
            if !value.is_finite() {
                return Err(GridError::NonFinite { field, value });
            }
        }

        if self.cell_size <= 0.0 {
            return Err(GridError::CellSize(self.cell_size));
        }
        if self.lat_min >= self.lat_max {
            return Err(GridError::EmptyRange {
                axis: "latitude",
                min: self.lat_min,
                max: self.lat_max,
            });
        }
        if self.lon_min >= self.lon_max {
            return Err(GridError::EmptyRange {
                axis: "longitude",
                min: self.lon_min,
                max: self.lon_max,
            });
        }
        Ok(())
    }

    /// Number of cell rows (latitude) and columns (longitude) inside the bounds.
    ///
    /// `(0, 0)` for an invalid grid.
    pub fn dimensions(&self) -> (usize, usize) {
        if self.validate().is_err() {
            return (0, 0);
        }
        let rows = ((self.lat_max - self.lat_min) / self.cell_size).ceil() as usize;
        let cols = ((self.lon_max - self.lon_min) / self.cell_size).ceil() as usize;
        (rows, cols)
    }

    /// Returns the cell containing a position.
    ///
    /// `None` only for a non-finite position or an invalid grid; positions
    /// outside the bounds get keys beyond the grid's rows and columns.
    pub fn cell_for(&self, latitude: f64, longitude: f64) -> Option<PartitionKey> {
        let (row, col) = self.indices(latitude, longitude)?;
        Some(PartitionKey::new(format!("{row},{col}")))
    }

    /// Returns the center of a cell inside the bounds given its key.
    pub fn cell_center(&self, key: &PartitionKey) -> Option<(f64, f64)> {
        let (row, col) = key.as_str().split_once(',')?;
        let row: usize = row.parse().ok()?;
        let col: usize = col.parse().ok()?;

        let (rows, cols) = self.dimensions();
        if row >= rows || col >= cols {
            return None;
        }

        Some((
            self.lat_min + (row as f64 + 0.5) * self.cell_size,
            self.lon_min + (col as f64 + 0.5) * self.cell_size,
        ))
    }

    /// Groups a fleet snapshot by cell.
    pub fn partition<I>(&self, records: I) -> Partitioned
    where
        I: IntoIterator<Item = VehicleRecord>,
    {
        let mut out = Partitioned::default();

        for record in records {
            match self.cell_for(record.latitude, record.longitude) {
                Some(key) => out.cells.entry(key).or_default().push(record),
                None => out.unplaced.push(record),
            }
        }

        out
    }

    /// Returns true if the position lies within the grid bounds.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }

    fn indices(&self, latitude: f64, longitude: f64) -> Option<(i64, i64)> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        let (rows, cols) = self.dimensions();
        if rows == 0 || cols == 0 {
            return None;
        }

        let row = ((latitude - self.lat_min) / self.cell_size).trunc() as i64;
        let col = ((longitude - self.lon_min) / self.cell_size).trunc() as i64;
        Some((row, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_dimensions() {
        assert_eq!(GridSpec::default().dimensions(), (10, 10));
    }

    #[test]
    fn test_cell_for_downtown_ottawa() {
        let grid = GridSpec::default();
        assert_eq!(grid.cell_for(45.42, -75.69).unwrap().as_str(), "4,3");
    }

    #[test]
    fn test_cell_for_edges() {
        let grid = GridSpec::default();

        assert_eq!(grid.cell_for(45.0, -76.0).unwrap().as_str(), "0,0");
        assert_eq!(grid.cell_for(46.0, -75.0).unwrap().as_str(), "10,10");
    }

    #[test]
    fn test_cell_for_outside_each_edge() {
        let grid = GridSpec::default();

        // Truncation toward zero folds the first half cell outside into row/col 0
        assert_eq!(grid.cell_for(44.95, -75.45).unwrap().as_str(), "0,5");
        assert_eq!(grid.cell_for(45.55, -76.05).unwrap().as_str(), "5,0");
        assert_eq!(grid.cell_for(44.85, -75.45).unwrap().as_str(), "-1,5");
        assert_eq!(grid.cell_for(45.55, -76.15).unwrap().as_str(), "5,-1");
        assert_eq!(grid.cell_for(46.25, -75.45).unwrap().as_str(), "12,5");
        assert_eq!(grid.cell_for(45.55, -74.85).unwrap().as_str(), "5,11");

        assert!(grid.cell_for(f64::NAN, -75.45).is_none());
    }

    #[test]
    fn test_new_rejects_unusable_grids() {
        assert!(GridSpec::new(45.0, 46.0, -76.0, -75.0, 0.1).is_ok());
        assert_eq!(
            GridSpec::new(45.0, 46.0, -76.0, -75.0, -0.1),
            Err(GridError::CellSize(-0.1))
        );
        assert!(matches!(
            GridSpec::new(45.0, 45.0, -76.0, -75.0, 0.1),
            Err(GridError::EmptyRange { axis: "latitude", .. })
        ));
        assert!(matches!(
            GridSpec::new(45.0, 46.0, -75.0, -76.0, 0.1),
            Err(GridError::EmptyRange { axis: "longitude", .. })
        ));
        assert!(matches!(
            GridSpec::new(45.0, 46.0, -76.0, -75.0, f64::NAN),
            Err(GridError::NonFinite { field: "cell_size", .. })
        ));
    }

    #[test]
    fn test_invalid_grid_places_nothing_without_panicking() {
        let flat = GridSpec {
            lat_max: 45.0,
            ..GridSpec::default()
        };
        let negative = GridSpec {
            cell_size: -0.1,
            ..GridSpec::default()
        };

        for grid in [flat, negative] {
            assert_eq!(grid.dimensions(), (0, 0));
            assert!(grid.cell_for(45.0, -75.5).is_none());
            assert!(grid.cell_for(45.5, -75.5).is_none());

            let split = grid.partition(vec![VehicleRecord::new("1", 45.5, -75.5, "95", 1.0)]);
            assert!(split.cells.is_empty());
            assert_eq!(split.unplaced.len(), 1);
        }
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: GridSpec = serde_json::from_str(
            r#"{"lat_min":45.0,"lat_max":46.0,"lon_min":-76.0,"lon_max":-75.0,"cell_size":0.1}"#,
        )
        .unwrap();
        assert_eq!(ok, GridSpec::default());

        let bad = serde_json::from_str::<GridSpec>(
            r#"{"lat_min":45.0,"lat_max":46.0,"lon_min":-76.0,"lon_max":-75.0,"cell_size":0.0}"#,
        );
        assert!(bad.unwrap_err().to_string().contains("cell size"));
    }

    #[test]
    fn test_cell_center() {
        let grid = GridSpec::default();
        let (lat, lon) = grid.cell_center(&"4,3".into()).unwrap();

        assert_relative_eq!(lat, 45.45, epsilon = 1e-9);
        assert_relative_eq!(lon, -75.65, epsilon = 1e-9);
        assert_eq!(grid.cell_for(lat, lon).unwrap().as_str(), "4,3");

        assert!(grid.cell_center(&"10,0".into()).is_none());
        assert!(grid.cell_center(&"A1".into()).is_none());
    }

    #[test]
    fn test_partition_groups_and_preserves_order() {
        let grid = GridSpec::default();
        let fleet = vec![
            VehicleRecord::new("a", 45.42, -75.69, "95", 1.0),
            VehicleRecord::new("b", 45.05, -75.95, "1", 2.0),
            VehicleRecord::new("c", 45.43, -75.68, "95", 3.0),
            VehicleRecord::new("d", 45.42, f64::NAN, "x", 0.0),
        ];

        let split = grid.partition(fleet);

        let downtown: Vec<&str> = split.cells[&PartitionKey::from("4,3")]
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(downtown, vec!["a", "c"]);
        assert_eq!(split.cells[&PartitionKey::from("0,0")][0].id, "b");
        assert_eq!(split.unplaced.len(), 1);
        assert_eq!(split.unplaced[0].id, "d");
    }
}
