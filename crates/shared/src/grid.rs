//! Local mirror of the grid as one visitor sees it.
//!
//! `GridState` keeps the raw beliefs (sold ledger, static sales, other
//! visitors' pending cells, my claim, my drag preview) and the painted
//! `CellState` of every cell. Painted state is always derived from the raw
//! beliefs with the priority `Sold > Mine > Preview > Pending > Free`, so
//! mutations never have to remember to repaint sold cells last.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Cell, GridGeometry, SoldLedger, StaticLedger},
    pricing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Free,
    Pending,
    Mine,
    Sold,
    Preview,
}

/// Cells whose painted state changed, with their new state.
pub type Repaint = Vec<(Cell, CellState)>;

#[derive(Debug, Clone)]
pub struct GridState {
    geometry: GridGeometry,
    painted: Vec<CellState>,
    static_cells: BTreeSet<Cell>,
    ledger: SoldLedger,
    pending: BTreeSet<Cell>,
    mine: BTreeSet<Cell>,
    preview: BTreeSet<Cell>,
}

impl GridState {
    pub fn new(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            painted: vec![CellState::Free; geometry.cell_count() as usize],
            static_cells: BTreeSet::new(),
            ledger: SoldLedger::new(),
            pending: BTreeSet::new(),
            mine: BTreeSet::new(),
            preview: BTreeSet::new(),
        }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn state(&self, cell: Cell) -> CellState {
        self.painted
            .get(cell.0 as usize)
            .copied()
            .unwrap_or(CellState::Free)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Cell, CellState)> + '_ {
        self.painted
            .iter()
            .enumerate()
            .map(|(index, state)| (Cell(index as u32), *state))
    }

    pub fn is_sold(&self, cell: Cell) -> bool {
        self.static_cells.contains(&cell) || self.ledger.contains_key(&cell)
    }

    pub fn is_mine(&self, cell: Cell) -> bool {
        self.mine.contains(&cell)
    }

    pub fn is_pending(&self, cell: Cell) -> bool {
        self.pending.contains(&cell)
    }

    /// Free to claim: on the grid, not sold, not mine and not held by anyone else.
    pub fn is_available(&self, cell: Cell) -> bool {
        self.geometry.contains(cell)
            && !self.is_sold(cell)
            && !self.is_mine(cell)
            && !self.is_pending(cell)
    }

    pub fn mine(&self) -> &BTreeSet<Cell> {
        &self.mine
    }

    pub fn claimed_cells(&self) -> Vec<Cell> {
        self.mine.iter().copied().collect()
    }

    pub fn preview(&self) -> &BTreeSet<Cell> {
        &self.preview
    }

    /// Distinct sold cells, dynamic sales plus expanded static regions.
    pub fn sold_count(&self) -> u64 {
        pricing::sold_count(&self.geometry, &self.static_cells, &self.ledger)
    }

    /// How many of `cells` carry a dynamic sale with exactly this artwork.
    pub fn sold_with_art(&self, cells: &[Cell], image_url: &str, link_url: &str) -> usize {
        cells
            .iter()
            .filter(|cell| {
                self.ledger
                    .get(cell)
                    .is_some_and(|record| record.same_artwork(image_url, link_url))
            })
            .count()
    }

    pub fn load_static(&mut self, static_ledger: StaticLedger) -> Repaint {
        let mut touched: BTreeSet<Cell> = std::mem::take(&mut self.static_cells);
        self.static_cells = static_ledger.covered_cells(&self.geometry);
        touched.extend(self.static_cells.iter().copied());
        self.repaint(touched)
    }

    pub fn claim(&mut self, cells: &[Cell]) -> Repaint {
        let added: Vec<Cell> = cells
            .iter()
            .copied()
            .filter(|cell| self.geometry.contains(*cell))
            .collect();
        self.mine.extend(added.iter().copied());
        self.repaint(added)
    }

    /// Drops cells from my claim. Their pending entries came from my own
    /// reservation, so they go too; the next status poll restores any that
    /// another visitor actually holds.
    pub fn release(&mut self, cells: &[Cell]) -> Repaint {
        for cell in cells {
            self.mine.remove(cell);
            self.pending.remove(cell);
        }
        self.repaint(cells.iter().copied())
    }

    /// Adopts the server's view of my claim.
    pub fn replace_claim(&mut self, cells: impl IntoIterator<Item = Cell>) -> Repaint {
        let next: BTreeSet<Cell> = cells
            .into_iter()
            .filter(|cell| self.geometry.contains(*cell))
            .collect();
        let previous = std::mem::replace(&mut self.mine, next);
        for dropped in previous.difference(&self.mine) {
            self.pending.remove(dropped);
        }
        let touched: BTreeSet<Cell> = previous.union(&self.mine).copied().collect();
        self.repaint(touched)
    }

    pub fn clear_claim(&mut self) -> Repaint {
        self.replace_claim(std::iter::empty())
    }

    /// Records that someone else now holds these cells.
    pub fn mark_pending(&mut self, cells: &[Cell]) -> Repaint {
        self.pending.extend(
            cells
                .iter()
                .copied()
                .filter(|cell| self.geometry.contains(*cell)),
        );
        self.repaint(cells.iter().copied())
    }

    pub fn set_preview(&mut self, cells: impl IntoIterator<Item = Cell>) -> Repaint {
        let next: BTreeSet<Cell> = cells.into_iter().collect();
        let previous = std::mem::replace(&mut self.preview, next);
        let touched: BTreeSet<Cell> = previous.union(&self.preview).copied().collect();
        self.repaint(touched)
    }

    pub fn take_preview(&mut self) -> (BTreeSet<Cell>, Repaint) {
        let previous = std::mem::take(&mut self.preview);
        let repaint = self.repaint(previous.iter().copied());
        (previous, repaint)
    }

    pub fn clear_preview(&mut self) -> Repaint {
        self.take_preview().1
    }

    /// Merges a status poll: replaces the pending set and folds in the sold
    /// ledger. Sold records are immutable, so cells never leave the ledger.
    pub fn apply_status(
        &mut self,
        pending: impl IntoIterator<Item = Cell>,
        art_cells: SoldLedger,
    ) -> Repaint {
        let next: BTreeSet<Cell> = pending
            .into_iter()
            .filter(|cell| self.geometry.contains(*cell))
            .collect();
        let previous = std::mem::replace(&mut self.pending, next);
        let mut touched: BTreeSet<Cell> = previous
            .symmetric_difference(&self.pending)
            .copied()
            .collect();
        touched.extend(art_cells.keys().copied());
        self.ledger.extend(art_cells);
        self.repaint(touched)
    }

    pub fn merge_ledger(&mut self, art_cells: SoldLedger) -> Repaint {
        let touched: Vec<Cell> = art_cells.keys().copied().collect();
        self.ledger.extend(art_cells);
        self.repaint(touched)
    }

    fn derive(&self, cell: Cell) -> CellState {
        if self.is_sold(cell) {
            CellState::Sold
        } else if self.mine.contains(&cell) {
            CellState::Mine
        } else if self.preview.contains(&cell) {
            CellState::Preview
        } else if self.pending.contains(&cell) {
            CellState::Pending
        } else {
            CellState::Free
        }
    }

    fn repaint(&mut self, cells: impl IntoIterator<Item = Cell>) -> Repaint {
        let mut changed = Repaint::new();
        let unique: BTreeSet<Cell> = cells.into_iter().collect();
        for cell in unique {
            let Some(slot) = self.painted.get(cell.0 as usize).copied() else {
                continue;
            };
            let next = self.derive(cell);
            if slot != next {
                self.painted[cell.0 as usize] = next;
                changed.push((cell, next));
            }
        }
        changed
    }
}

#[cfg(test)]
#[path = "tests/grid_tests.rs"]
mod tests;
