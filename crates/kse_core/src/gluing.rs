//! Composing orbits into larger initial guesses.
//!
//! Tiles sit on a grid whose rows are stacked in time and whose columns are
//! laid side by side in space. Each tile is resampled, moved to the laboratory
//! frame and concatenated; the combined field must then be representable in
//! the requested symmetry class.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use anyhow::{Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discretization::resize;
use crate::error::OrbitError;
use crate::orbit::{Discretization, Orbit, Parameter, Parameters};
use crate::symmetry::{comoving_field, estimate_shift, physical_field, Symmetry};
use crate::transforms::symmetry_defect;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GluingSettings {
    /// Replaces the summed period of the glued orbit.
    pub period: Option<f64>,
    /// Replaces the summed length of the glued orbit.
    pub length: Option<f64>,
    /// Largest relative symmetry defect accepted for the combined field.
    pub tolerance: f64,
    /// In one-dimensional arrangements, size each tile along the glued axis in
    /// proportion to its own period or length.
    pub correct_aspect_ratio: bool,
}

impl Default for GluingSettings {
    fn default() -> Self {
        Self {
            period: None,
            length: None,
            tolerance: 1e-8,
            correct_aspect_ratio: true,
        }
    }
}

fn mean_positive(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .filter(|v| *v > 0.0)
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn even_at_least(value: f64, floor: usize) -> usize {
    let even = 2 * (value / 2.0).round() as usize;
    even.max(floor)
}

/// Grid shape of every tile before concatenation.
fn tile_shapes(
    grid: &[Vec<Orbit>],
    periods: &[Vec<f64>],
    settings: &GluingSettings,
) -> Vec<Vec<Discretization>> {
    let tiles = || grid.iter().flatten();
    let max_time = tiles()
        .filter(|t| !t.symmetry().is_stationary())
        .map(|t| t.discretization().time_points)
        .max()
        .unwrap_or(1);
    let max_space = tiles().map(|t| t.discretization().space_points).max().unwrap_or(4);
    let uniform = Discretization::new(max_time, max_space);
    let (rows, cols) = (grid.len(), grid[0].len());

    let along_space = rows == 1 && cols > 1 && settings.correct_aspect_ratio;
    let along_time = cols == 1 && rows > 1 && settings.correct_aspect_ratio;
    if along_space {
        let density = tiles()
            .map(|t| t.discretization().space_points as f64 / t.parameters().length)
            .fold(0.0, f64::max);
        let row = grid[0]
            .iter()
            .map(|t| Discretization::new(max_time, even_at_least(density * t.parameters().length, 4)))
            .collect();
        vec![row]
    } else if along_time {
        let density = tiles()
            .zip(periods.iter().flatten())
            .filter(|(t, _)| !t.symmetry().is_stationary())
            .map(|(t, &p)| t.discretization().time_points as f64 / p)
            .fold(0.0, f64::max);
        periods
            .iter()
            .map(|row| vec![Discretization::new(even_at_least(density * row[0], 2), max_space)])
            .collect()
    } else {
        vec![vec![uniform; cols]; rows]
    }
}

/// Glues a grid of tiles into one orbit of class `target`, in the modes basis.
///
/// A single tile already in `target` is returned as it is, basis included,
/// unless the period or length is overridden.
///
/// The period is the sum over rows of each row's mean period and the length
/// is the sum over columns of each column's mean length, unless overridden.
/// Stationary tiles borrow the mean period of the periodic ones; when every
/// tile is stationary and the target carries a period, it is set to 1.
pub fn glue(grid: &[Vec<Orbit>], target: Symmetry, settings: &GluingSettings) -> Result<Orbit> {
    let rows = grid.len();
    let cols = grid.first().map_or(0, Vec::len);
    if cols == 0 || grid.iter().any(|row| row.len() != cols) {
        return Err(OrbitError::IncompatibleTiles(
            "tile grid must be a non-empty rectangle".to_string(),
        )
        .into());
    }
    if target.is_stationary() && rows > 1 {
        return Err(OrbitError::UnsupportedOperation {
            operation: "gluing in time",
            symmetry: target,
        }
        .into());
    }
    let overridden = settings.period.is_some() || settings.length.is_some();
    if rows == 1 && cols == 1 && grid[0][0].symmetry() == target && !overridden {
        return Ok(grid[0][0].clone());
    }

    let fallback_period =
        mean_positive(grid.iter().flatten().map(|t| t.parameters().period)).unwrap_or(0.0);
    let periods: Vec<Vec<f64>> = grid
        .iter()
        .map(|row| {
            let period = mean_positive(row.iter().map(|t| t.parameters().period))
                .unwrap_or(fallback_period);
            vec![period; cols]
        })
        .collect();
    let mut period = settings
        .period
        .unwrap_or_else(|| periods.iter().map(|row| row[0]).sum());
    if period == 0.0 && target.parameters().contains(&Parameter::Period) {
        period = 1.0;
    }
    let length = settings.length.unwrap_or_else(|| {
        (0..cols)
            .map(|c| grid.iter().map(|row| row[c].parameters().length).sum::<f64>() / rows as f64)
            .sum()
    });

    let shapes = tile_shapes(grid, &periods, settings);
    let mut blocks: Vec<DMatrix<f64>> = Vec::with_capacity(rows);
    for (r, row) in grid.iter().enumerate() {
        let mut fields = Vec::with_capacity(cols);
        for (c, tile) in row.iter().enumerate() {
            let resized = resize(tile, shapes[r][c])
                .with_context(|| format!("Failed to resample tile ({}, {}).", r, c))?;
            fields.push(physical_field(&resized)?);
        }
        let width = fields.iter().map(|f| f.ncols()).sum();
        let mut block = DMatrix::zeros(fields[0].nrows(), width);
        let mut offset = 0;
        for field in &fields {
            block.columns_mut(offset, field.ncols()).copy_from(field);
            offset += field.ncols();
        }
        blocks.push(block);
    }
    let height = blocks.iter().map(|b| b.nrows()).sum();
    let mut field = DMatrix::zeros(height, blocks[0].ncols());
    let mut offset = 0;
    for block in &blocks {
        field.rows_mut(offset, block.nrows()).copy_from(block);
        offset += block.nrows();
    }

    let mut parameters = Parameters::new(period, length);
    if target.is_comoving() {
        parameters.shift = estimate_shift(&field, length);
        field = comoving_field(&field, parameters);
    }
    let defect = symmetry_defect(&field, target)?;
    debug!(
        rows,
        cols,
        shape = ?field.shape(),
        period,
        length,
        defect,
        "glued tiles"
    );
    if defect > settings.tolerance {
        return Err(OrbitError::SymmetryViolation {
            symmetry: target,
            defect,
        }
        .into());
    }
    Ok(Orbit::from_field(field, parameters, target)?.to_modes()?)
}

/// Glues tiles looked up by symbol in a read-only catalog.
pub fn tile<K>(
    symbols: &[Vec<K>],
    catalog: &HashMap<K, Orbit>,
    target: Symmetry,
    settings: &GluingSettings,
) -> Result<Orbit>
where
    K: Eq + Hash + Debug,
{
    let grid = symbols
        .iter()
        .map(|row| {
            row.iter()
                .map(|symbol| {
                    catalog.get(symbol).cloned().ok_or_else(|| {
                        OrbitError::IncompatibleTiles(format!("no tile named {:?}", symbol))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    glue(&grid, target, settings)
}
