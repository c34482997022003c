//! One visitor's selection session.
//!
//! `SelectionController` owns everything a browser tab used to keep in loose
//! globals: the local grid mirror, the reservation id, the drag gesture and
//! the "already bought" flag. Every mutation goes through `&mut self`, so a
//! session never has two lock or finalize calls in flight at once.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Cell, GridGeometry, ReservationId, PIXELS_PER_CELL},
    grid::{GridState, Repaint},
    pricing::{pixels_left, quote, unit_price, Price},
    protocol::{FinalizeRequest, LockOp, LockRequest, LockResponse, StatusResponse},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendError, GridBackend},
    persistence::{PersistedSelection, SelectionStore},
};

pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1200);
/// Share of the intended cells (in percent) that must show my artwork before
/// a failed finalize is assumed to have landed anyway.
pub const LEDGER_CHECK_PERCENT: usize = 80;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionEvent {
    Repainted(Repaint),
    ClaimChanged {
        cells: Vec<Cell>,
        reservation_id: Option<ReservationId>,
    },
    PurchaseCommitted(PurchaseOutcome),
    Alert(String),
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("select at least one block first")]
    NothingClaimed,
    #[error("an image is required")]
    MissingImage,
    #[error("a link is required")]
    MissingLink,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurchaseForm {
    pub image_url: String,
    pub link_url: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseConfirmation {
    /// Finalize answered `ok`.
    Server,
    /// Finalize failed but the refreshed ledger shows the cells sold with my
    /// artwork. Approximate.
    LedgerCheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub cells: Vec<Cell>,
    pub confirmation: PurchaseConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Claimed,
    Released,
    /// Sold, held by someone else, or off the grid.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionSummary {
    pub cells: usize,
    pub pixels: u64,
    pub total: Price,
    pub unit_price: Price,
    pub pixels_left: u64,
}

#[derive(Debug, Clone, Copy)]
struct DragGesture {
    anchor: Cell,
    pointer: Cell,
    dirty: bool,
}

struct SessionState {
    grid: GridState,
    reservation_id: Option<ReservationId>,
    purchase_committed: bool,
    drag: Option<DragGesture>,
}

pub struct SelectionController {
    backend: Arc<dyn GridBackend>,
    store: Box<dyn SelectionStore>,
    state: SessionState,
    events: broadcast::Sender<SelectionEvent>,
}

impl SelectionController {
    pub fn new(
        backend: Arc<dyn GridBackend>,
        store: Box<dyn SelectionStore>,
        geometry: GridGeometry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            store,
            state: SessionState {
                grid: GridState::new(geometry),
                reservation_id: None,
                purchase_committed: false,
                drag: None,
            },
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SelectionEvent> {
        self.events.subscribe()
    }

    pub fn grid(&self) -> &GridState {
        &self.state.grid
    }

    pub fn reservation_id(&self) -> Option<&ReservationId> {
        self.state.reservation_id.as_ref()
    }

    pub fn claimed_cells(&self) -> Vec<Cell> {
        self.state.grid.claimed_cells()
    }

    pub fn purchase_committed(&self) -> bool {
        self.state.purchase_committed
    }

    pub fn is_dragging(&self) -> bool {
        self.state.drag.is_some()
    }

    /// Picks up where a previous session left off: saved claim, static
    /// sales, then one status poll.
    pub async fn restore(&mut self) {
        match self.store.load() {
            Ok(Some(saved)) => {
                self.state.reservation_id = saved.reservation_id;
                let repaint = self.state.grid.claim(&saved.blocks);
                self.publish(repaint);
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "selection: could not read saved selection"),
        }

        match self.backend.static_ledger().await {
            Ok(static_ledger) => {
                let repaint = self.state.grid.load_static(static_ledger);
                self.publish(repaint);
            }
            Err(error) => warn!(%error, "selection: static ledger unavailable"),
        }

        self.poll_status().await;

        let stale: Vec<Cell> = self
            .state
            .grid
            .mine()
            .iter()
            .copied()
            .filter(|cell| self.state.grid.is_sold(*cell))
            .collect();
        if !stale.is_empty() {
            info!(cells = stale.len(), "selection: dropping restored cells that sold meanwhile");
            let repaint = self.state.grid.release(&stale);
            self.publish(repaint);
        }
        self.persist();
        self.announce_claim();
    }

    pub async fn toggle(&mut self, cell: Cell) -> Result<ToggleOutcome, SelectionError> {
        if !self.state.grid.geometry().contains(cell) {
            return Ok(ToggleOutcome::Ignored);
        }
        if self.state.grid.is_mine(cell) {
            return self.release_cell(cell).await;
        }
        if self.state.grid.is_sold(cell) || self.state.grid.is_pending(cell) {
            return Ok(ToggleOutcome::Ignored);
        }

        let repaint = self.state.grid.claim(&[cell]);
        self.publish(repaint);

        let request = LockRequest {
            op: LockOp::Add,
            blocks: vec![cell],
            reservation_id: self.state.reservation_id.clone(),
        };
        match self.backend.lock(request).await {
            Ok(response) => {
                self.adopt_lock_response(LockOp::Add, response);
                Ok(ToggleOutcome::Claimed)
            }
            Err(BackendError::Conflict) => {
                debug!(cell = cell.0, "selection: cell taken concurrently");
                let mut repaint = self.state.grid.release(&[cell]);
                repaint.extend(self.state.grid.mark_pending(&[cell]));
                self.publish(repaint);
                Err(BackendError::Conflict.into())
            }
            Err(err) => {
                warn!(cell = cell.0, error = %err, "selection: lock add failed");
                let repaint = self.state.grid.release(&[cell]);
                self.publish(repaint);
                Err(err.into())
            }
        }
    }

    async fn release_cell(&mut self, cell: Cell) -> Result<ToggleOutcome, SelectionError> {
        let repaint = self.state.grid.release(&[cell]);
        self.publish(repaint);

        let Some(reservation_id) = self.state.reservation_id.clone() else {
            self.persist();
            self.announce_claim();
            return Ok(ToggleOutcome::Released);
        };

        let request = LockRequest {
            op: LockOp::Remove,
            blocks: vec![cell],
            reservation_id: Some(reservation_id),
        };
        match self.backend.lock(request).await {
            Ok(response) => {
                self.adopt_lock_response(LockOp::Remove, response);
                Ok(ToggleOutcome::Released)
            }
            Err(err) => {
                warn!(cell = cell.0, error = %err, "selection: lock remove failed");
                let repaint = self.state.grid.claim(&[cell]);
                self.publish(repaint);
                Err(err.into())
            }
        }
    }

    /// Starts a rectangle gesture. Nothing is sent before `end_drag`.
    pub fn begin_drag(&mut self, start: Cell) {
        if !self.state.grid.geometry().contains(start) {
            return;
        }
        self.state.drag = Some(DragGesture {
            anchor: start,
            pointer: start,
            dirty: true,
        });
    }

    /// Records pointer movement. The preview follows on the next frame.
    pub fn drag_to(&mut self, cell: Cell) {
        let in_grid = self.state.grid.geometry().contains(cell);
        if let Some(drag) = self.state.drag.as_mut() {
            if in_grid && drag.pointer != cell {
                drag.pointer = cell;
                drag.dirty = true;
            }
        }
    }

    /// Recomputes the preview at most once per frame, and only after the
    /// pointer moved.
    pub fn animation_frame(&mut self) -> Repaint {
        let Some(drag) = self.state.drag.as_mut() else {
            return Repaint::new();
        };
        if !drag.dirty {
            return Repaint::new();
        }
        drag.dirty = false;
        let (anchor, pointer) = (drag.anchor, drag.pointer);

        let grid = &self.state.grid;
        let preview: Vec<Cell> = grid
            .geometry()
            .rect(anchor, pointer)
            .into_iter()
            .filter(|cell| grid.is_available(*cell))
            .collect();
        let repaint = self.state.grid.set_preview(preview);
        self.publish(repaint.clone());
        repaint
    }

    /// Ends the gesture and claims every previewed cell in one lock call.
    /// A failed call rolls the whole batch back to free.
    pub async fn end_drag(&mut self) -> Result<Vec<Cell>, SelectionError> {
        if self.state.drag.is_none() {
            return Ok(Vec::new());
        }
        self.animation_frame();
        self.state.drag = None;

        let (previewed, mut repaint) = self.state.grid.take_preview();
        let batch: Vec<Cell> = previewed
            .into_iter()
            .filter(|cell| self.state.grid.is_available(*cell))
            .collect();
        if batch.is_empty() {
            self.publish(repaint);
            return Ok(batch);
        }
        repaint.extend(self.state.grid.claim(&batch));
        self.publish(repaint);

        let request = LockRequest {
            op: LockOp::Add,
            blocks: batch.clone(),
            reservation_id: self.state.reservation_id.clone(),
        };
        match self.backend.lock(request).await {
            Ok(response) => {
                self.adopt_lock_response(LockOp::Add, response);
                info!(cells = batch.len(), "selection: drag claimed cells");
                Ok(batch)
            }
            Err(err) => {
                warn!(cells = batch.len(), error = %err, "selection: batched lock failed");
                let repaint = self.state.grid.release(&batch);
                self.publish(repaint);
                Err(err.into())
            }
        }
    }

    pub fn cancel_drag(&mut self) {
        self.state.drag = None;
        let repaint = self.state.grid.clear_preview();
        self.publish(repaint);
    }

    pub fn reconcile_status(&mut self, status: StatusResponse) -> Repaint {
        let repaint = self.state.grid.apply_status(status.pending, status.art_cells);
        self.publish(repaint.clone());
        repaint
    }

    /// One status round trip. Failures only cost freshness.
    pub async fn poll_status(&mut self) {
        match self.backend.status().await {
            Ok(status) => {
                self.reconcile_status(status);
            }
            Err(error) => debug!(%error, "selection: status poll failed"),
        }
    }

    pub async fn submit_purchase(
        &mut self,
        form: PurchaseForm,
    ) -> Result<PurchaseOutcome, SelectionError> {
        let cells = self.state.grid.claimed_cells();
        if cells.is_empty() {
            return Err(SelectionError::NothingClaimed);
        }
        let image_url = form.image_url.trim();
        if image_url.is_empty() {
            return Err(SelectionError::MissingImage);
        }
        let link_url = form.link_url.trim();
        if link_url.is_empty() {
            return Err(SelectionError::MissingLink);
        }
        let name = form.name.trim();

        let request = FinalizeRequest::for_claim(
            self.state.reservation_id.as_ref(),
            image_url,
            link_url,
            name,
            &cells,
        );
        let mut result = self.backend.finalize(request).await;

        if matches!(&result, Err(err) if err.is_lock_not_found()) {
            info!(cells = cells.len(), "selection: reservation lost, re-acquiring before one retry");
            let relock = LockRequest {
                op: LockOp::Add,
                blocks: cells.clone(),
                reservation_id: None,
            };
            match self.backend.lock(relock).await {
                Ok(response) => {
                    self.adopt_lock_response(LockOp::Add, response);
                    let retry = FinalizeRequest::for_claim(
                        self.state.reservation_id.as_ref(),
                        image_url,
                        link_url,
                        name,
                        &cells,
                    );
                    result = self.backend.finalize(retry).await;
                }
                Err(error) => warn!(%error, "selection: could not re-acquire reservation"),
            }
        }

        match result {
            Ok(success) => {
                let repaint = self.state.grid.merge_ledger(success.art_cells);
                self.publish(repaint);
                Ok(self
                    .commit_purchase(success.sold_blocks, PurchaseConfirmation::Server)
                    .await)
            }
            Err(err) => {
                self.poll_status().await;
                let landed = self.state.grid.sold_with_art(&cells, image_url, link_url);
                if landed * 100 >= cells.len() * LEDGER_CHECK_PERCENT {
                    warn!(
                        error = %err,
                        landed,
                        intended = cells.len(),
                        "selection: finalize errored but ledger shows the sale"
                    );
                    let sold: Vec<Cell> = cells
                        .into_iter()
                        .filter(|cell| {
                            self.state.grid.sold_with_art(&[*cell], image_url, link_url) == 1
                        })
                        .collect();
                    // Whatever hold is left covers cells that did not sell.
                    if let Some(reservation_id) = self.state.reservation_id.take() {
                        if let Err(error) = self.backend.unlock(&reservation_id).await {
                            warn!(%reservation_id, %error, "selection: unlock failed");
                        }
                    }
                    return Ok(self
                        .commit_purchase(sold, PurchaseConfirmation::LedgerCheck)
                        .await);
                }
                warn!(error = %err, "selection: purchase failed");
                self.alert(format!("Purchase failed: {err}"));
                Err(err.into())
            }
        }
    }

    async fn commit_purchase(
        &mut self,
        cells: Vec<Cell>,
        confirmation: PurchaseConfirmation,
    ) -> PurchaseOutcome {
        self.state.reservation_id = None;
        self.state.purchase_committed = true;
        let repaint = self.state.grid.clear_claim();
        self.publish(repaint);
        if let Err(error) = self.store.clear() {
            warn!(%error, "selection: could not clear saved selection");
        }
        self.announce_claim();
        self.poll_status().await;

        info!(cells = cells.len(), ?confirmation, "selection: purchase committed");
        let outcome = PurchaseOutcome {
            cells,
            confirmation,
        };
        let _ = self
            .events
            .send(SelectionEvent::PurchaseCommitted(outcome.clone()));
        outcome
    }

    /// Gives the claim back. Unlock failures are logged, never surfaced.
    pub async fn cancel(&mut self) {
        if self.state.purchase_committed {
            return;
        }
        if let Some(reservation_id) = self.state.reservation_id.take() {
            if let Err(error) = self.backend.unlock(&reservation_id).await {
                warn!(%reservation_id, %error, "selection: unlock failed");
            }
        }
        self.state.drag = None;
        let mut repaint = self.state.grid.clear_preview();
        repaint.extend(self.state.grid.clear_claim());
        self.publish(repaint);
        if let Err(error) = self.store.clear() {
            warn!(%error, "selection: could not clear saved selection");
        }
        self.announce_claim();
        self.poll_status().await;
    }

    /// Best-effort release when the session goes away. Spawned on the current
    /// runtime and never awaited or retried.
    pub fn on_page_unload(&self) {
        if self.state.purchase_committed {
            return;
        }
        let Some(reservation_id) = self.state.reservation_id.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("selection: no runtime for unload release");
            return;
        };
        let backend = self.backend.clone();
        runtime.spawn(async move {
            if let Err(error) = backend.unlock(&reservation_id).await {
                debug!(%reservation_id, %error, "selection: unload release failed");
            }
        });
    }

    pub fn summary(&self) -> SelectionSummary {
        let grid = &self.state.grid;
        let sold = grid.sold_count();
        let cells = grid.mine().len();
        SelectionSummary {
            cells,
            pixels: cells as u64 * PIXELS_PER_CELL,
            total: quote(sold, cells as u64),
            unit_price: unit_price(sold),
            pixels_left: pixels_left(grid.geometry(), sold),
        }
    }

    fn adopt_lock_response(&mut self, op: LockOp, response: LockResponse) {
        let reservation = response.live_reservation();
        let repaint = if reservation.is_none() && op == LockOp::Remove {
            self.state.reservation_id = None;
            self.state.grid.clear_claim()
        } else {
            if reservation.is_some() {
                self.state.reservation_id = reservation;
            }
            match response.blocks {
                Some(blocks) => self.state.grid.replace_claim(blocks),
                None => Repaint::new(),
            }
        };
        if op == LockOp::Add {
            self.state.purchase_committed = false;
        }
        self.publish(repaint);
        self.persist();
        self.announce_claim();
    }

    fn persist(&self) {
        let selection = PersistedSelection {
            reservation_id: self.state.reservation_id.clone(),
            blocks: self.state.grid.claimed_cells(),
        };
        let result = if selection.is_empty() {
            self.store.clear()
        } else {
            self.store.save(&selection)
        };
        if let Err(error) = result {
            warn!(%error, "selection: could not save selection");
        }
    }

    fn announce_claim(&self) {
        let _ = self.events.send(SelectionEvent::ClaimChanged {
            cells: self.state.grid.claimed_cells(),
            reservation_id: self.state.reservation_id.clone(),
        });
    }

    fn alert(&self, message: String) {
        let _ = self.events.send(SelectionEvent::Alert(message));
    }

    fn publish(&self, repaint: Repaint) {
        if !repaint.is_empty() {
            let _ = self.events.send(SelectionEvent::Repainted(repaint));
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
