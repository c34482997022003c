//! Step pricing shared by the buy flow and the price header.
//!
//! The unit (per pixel) price starts at $1.00 and rises by one cent for every
//! ten cells sold. It is computed in whole cents so that both sides of the
//! wire agree on it bit for bit. It never decreases for a given sold count.

use std::collections::BTreeSet;

use crate::domain::{Cell, GridGeometry, SoldLedger, PIXELS_PER_CELL};

pub const PRICE_STEP_CELLS: u64 = 10;
const BASE_UNIT_CENTS: u64 = 100;
const STEP_CENTS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price {
    cents: u64,
}

impl Price {
    pub const fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    pub fn as_f64(self) -> f64 {
        self.cents as f64 / 100.0
    }

    pub fn times(self, quantity: u64) -> Self {
        Self {
            cents: self.cents.saturating_mul(quantity),
        }
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}.{:02}", self.cents / 100, self.cents % 100)
    }
}

/// Distinct sold cells on the grid: static cells plus dynamic sales that no
/// static sale already covers. Off-grid ids never count.
pub fn sold_count(
    geometry: &GridGeometry,
    static_cells: &BTreeSet<Cell>,
    ledger: &SoldLedger,
) -> u64 {
    let static_on_grid = static_cells
        .iter()
        .filter(|cell| geometry.contains(**cell))
        .count();
    let dynamic_only = ledger
        .keys()
        .filter(|cell| geometry.contains(**cell) && !static_cells.contains(cell))
        .count();
    (static_on_grid + dynamic_only) as u64
}

/// Price of one pixel once `sold_count` cells are gone.
pub fn unit_price(sold_count: u64) -> Price {
    Price::from_cents(BASE_UNIT_CENTS + (sold_count / PRICE_STEP_CELLS) * STEP_CENTS)
}

/// Price of one cell (100 pixels).
pub fn cell_price(sold_count: u64) -> Price {
    unit_price(sold_count).times(PIXELS_PER_CELL)
}

/// Total for a claim of `cells` cells at the current step.
pub fn quote(sold_count: u64, cells: u64) -> Price {
    cell_price(sold_count).times(cells)
}

pub fn pixels_left(geometry: &GridGeometry, sold_count: u64) -> u64 {
    (u64::from(geometry.cell_count()) * PIXELS_PER_CELL)
        .saturating_sub(sold_count * PIXELS_PER_CELL)
}
