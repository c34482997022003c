use std::{collections::BTreeSet, sync::Arc};

use shared::{
    domain::{Cell, GridGeometry, StaticLedger},
    error::{ApiError, ErrorCode},
};
use storage::GridStore;

mod finalize;

pub use finalize::{finalize, reconcile, validate_artwork, Artwork};

pub const DEFAULT_FINALIZE_MAX_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn GridStore>,
    pub geometry: GridGeometry,
    /// Cells covered by the static ledger; never sellable again.
    pub static_cells: Arc<BTreeSet<Cell>>,
    pub finalize_max_attempts: usize,
}

impl ApiContext {
    pub fn new(store: Arc<dyn GridStore>, geometry: GridGeometry) -> Self {
        Self {
            store,
            geometry,
            static_cells: Arc::new(BTreeSet::new()),
            finalize_max_attempts: DEFAULT_FINALIZE_MAX_ATTEMPTS,
        }
    }

    pub fn with_static_ledger(mut self, static_ledger: &StaticLedger) -> Self {
        self.static_cells = Arc::new(static_ledger.covered_cells(&self.geometry));
        self
    }

    pub fn with_finalize_max_attempts(mut self, attempts: usize) -> Self {
        self.finalize_max_attempts = attempts.max(1);
        self
    }

    pub fn is_statically_sold(&self, cell: Cell) -> bool {
        self.static_cells.contains(&cell)
    }
}

fn store_access(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::StoreAccessError, format!("{err:#}"))
}

fn store_save(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::StoreSaveError, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::Region;
    use storage::Storage;

    #[tokio::test]
    async fn static_regions_are_expanded_once_into_the_context() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ledger = StaticLedger {
            cells: Default::default(),
            regions: vec![Region {
                start: Cell(0),
                w: 2,
                h: 2,
                image_url: None,
                link_url: None,
            }],
        };
        let ctx = ApiContext::new(Arc::new(storage), GridGeometry::new(10, 10))
            .with_static_ledger(&ledger);
        assert!(ctx.is_statically_sold(Cell(0)));
        assert!(ctx.is_statically_sold(Cell(11)));
        assert!(!ctx.is_statically_sold(Cell(2)));
    }

    #[tokio::test]
    async fn finalize_attempts_never_drop_below_one() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext::new(Arc::new(storage), GridGeometry::default())
            .with_finalize_max_attempts(0);
        assert_eq!(ctx.finalize_max_attempts, 1);
    }
}
