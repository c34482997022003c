//! Client side of the grid: the selection state machine and the services it
//! talks to.

pub mod backend;
pub mod controller;
pub mod persistence;

pub use backend::{BackendEndpoints, BackendError, GridBackend, HttpGridBackend};
pub use controller::{
    PurchaseConfirmation, PurchaseForm, PurchaseOutcome, SelectionController, SelectionError,
    SelectionEvent, SelectionSummary, ToggleOutcome, STATUS_POLL_INTERVAL,
};
pub use persistence::{
    JsonFileSelectionStore, MemorySelectionStore, PersistedSelection, SelectionStore,
};
