use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const DEFAULT_GRID_WIDTH: u32 = 100;
pub const DEFAULT_GRID_HEIGHT: u32 = 100;
pub const PIXELS_PER_CELL: u64 = 100;

/// Address of one block of the grid, `row * width + col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cell(pub u32);

/// Opaque reservation handle minted by the lock service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

impl ReservationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Treats empty and whitespace-only ids as absent.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_WIDTH,
            height: DEFAULT_GRID_HEIGHT,
        }
    }
}

impl GridGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `None` for an empty grid or one whose cell ids would not fit a `u32`.
    pub fn checked(width: u32, height: u32) -> Option<Self> {
        match width.checked_mul(height) {
            Some(count) if count > 0 => Some(Self { width, height }),
            _ => None,
        }
    }

    pub fn cell_count(&self) -> u32 {
        self.width.saturating_mul(self.height)
    }

    pub fn contains(&self, cell: Cell) -> bool {
        cell.0 < self.cell_count()
    }

    pub fn row_col(&self, cell: Cell) -> (u32, u32) {
        (cell.0 / self.width, cell.0 % self.width)
    }

    pub fn cell_at(&self, row: u32, col: u32) -> Option<Cell> {
        (row < self.height && col < self.width).then(|| Cell(row * self.width + col))
    }

    /// Inclusive axis-aligned rectangle spanned by two corners, in row-major order.
    pub fn rect(&self, a: Cell, b: Cell) -> Vec<Cell> {
        if !self.contains(a) || !self.contains(b) {
            return Vec::new();
        }
        let (a_row, a_col) = self.row_col(a);
        let (b_row, b_col) = self.row_col(b);
        let (r0, r1) = (a_row.min(b_row), a_row.max(b_row));
        let (c0, c1) = (a_col.min(b_col), a_col.max(b_col));

        let mut cells = Vec::with_capacity(((r1 - r0 + 1) * (c1 - c0 + 1)) as usize);
        for row in r0..=r1 {
            for col in c0..=c1 {
                cells.push(Cell(row * self.width + col));
            }
        }
        cells
    }

    /// Parses a loosely typed block id, dropping anything outside `[0, N)`.
    pub fn parse_cell(&self, value: &serde_json::Value) -> Option<Cell> {
        let raw = match value {
            serde_json::Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64)
            })?,
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };
        let cell = Cell(u32::try_from(raw).ok()?);
        self.contains(cell).then_some(cell)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Artwork attached to a sold cell. Never replaced once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoldRecord {
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub link_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sold_at: i64,
}

impl SoldRecord {
    pub fn same_artwork(&self, image_url: &str, link_url: &str) -> bool {
        self.image_url == image_url && self.link_url == link_url
    }
}

pub type SoldLedger = BTreeMap<Cell, SoldRecord>;

/// A pre-existing compound sale covering `w` x `h` cells from `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub start: Cell,
    #[serde(default = "one")]
    pub w: u32,
    #[serde(default = "one")]
    pub h: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
}

fn one() -> u32 {
    1
}

impl Region {
    pub fn cells(&self, geometry: &GridGeometry) -> Vec<Cell> {
        if !geometry.contains(self.start) {
            return Vec::new();
        }
        let (row, col) = geometry.row_col(self.start);
        let mut cells = Vec::new();
        for dy in 0..self.h.max(1) {
            for dx in 0..self.w.max(1) {
                if let Some(cell) = geometry.cell_at(row + dy, col + dx) {
                    cells.push(cell);
                }
            }
        }
        cells
    }
}

/// Sales that predate the dynamic ledger, shipped as a static JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLedger {
    #[serde(default)]
    pub cells: SoldLedger,
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl StaticLedger {
    /// Accepts `{ "cells": .., "regions": .. }` as well as a bare `{ cellId: record }` map.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        if value.get("cells").is_some() || value.get("regions").is_some() {
            return serde_json::from_value(value);
        }
        Ok(Self {
            cells: serde_json::from_value(value)?,
            regions: Vec::new(),
        })
    }

    pub fn covered_cells(&self, geometry: &GridGeometry) -> BTreeSet<Cell> {
        let mut covered: BTreeSet<Cell> = self
            .cells
            .keys()
            .copied()
            .filter(|cell| geometry.contains(*cell))
            .collect();
        for region in &self.regions {
            covered.extend(region.cells(geometry));
        }
        covered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(default)]
    pub blocks: Vec<Cell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Reservation {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now_ms)
    }
}

/// The shared document holding every sale and every reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDocument {
    #[serde(default)]
    pub sold: SoldLedger,
    #[serde(default)]
    pub locks: BTreeMap<ReservationId, Reservation>,
}

impl GridDocument {
    pub fn live_reservation(&self, id: &ReservationId, now_ms: i64) -> Option<&Reservation> {
        self.locks.get(id).filter(|lock| lock.is_live(now_ms))
    }

    /// Cells held by live reservations other than `except`.
    pub fn locked_by_others(&self, except: Option<&ReservationId>, now_ms: i64) -> BTreeSet<Cell> {
        self.locks
            .iter()
            .filter(|(id, lock)| Some(*id) != except && lock.is_live(now_ms))
            .flat_map(|(_, lock)| lock.blocks.iter().copied())
            .collect()
    }

    pub fn pending_cells(&self, now_ms: i64) -> BTreeSet<Cell> {
        self.locked_by_others(None, now_ms)
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
