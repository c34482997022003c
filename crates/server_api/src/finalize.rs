//! Turning a reservation (or a bare list of cells) into permanent sales.
//!
//! Every call is one optimistic transaction over the shared grid document:
//! read it with its version, decide which cells this request sells, and write
//! it back only if nobody else wrote in between. A lost race simply re-runs
//! the decision against the fresh document, which is what keeps two buyers
//! from ever owning the same cell.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    domain::{now_millis, Cell, GridDocument, SoldRecord},
    error::{ApiError, ErrorCode},
    protocol::{FinalizeRequest, FinalizeSuccess},
};
use storage::SaveOutcome;
use tracing::{debug, info, warn};

use crate::{store_access, store_save, ApiContext};

/// The validated, trimmed artwork a sale attaches to each cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artwork {
    pub image_url: String,
    pub link_url: String,
    pub name: String,
}

impl Artwork {
    fn record(&self, sold_at: i64) -> SoldRecord {
        SoldRecord {
            image_url: self.image_url.clone(),
            link_url: self.link_url.clone(),
            name: self.name.clone(),
            sold_at,
        }
    }
}

pub fn validate_artwork(request: &FinalizeRequest) -> Result<Artwork, ApiError> {
    let image_url = request.image_url.trim();
    if image_url.is_empty() {
        return Err(ApiError::new(ErrorCode::MissingImage, "imageUrl is required"));
    }
    if !is_acceptable_image(image_url) {
        return Err(ApiError::new(
            ErrorCode::InvalidRequestBody,
            "imageUrl must be a data: URL or an http(s) URL",
        ));
    }
    let link_url = request.link_url.trim();
    if link_url.is_empty() {
        return Err(ApiError::new(ErrorCode::MissingLink, "linkUrl is required"));
    }
    Ok(Artwork {
        image_url: image_url.to_string(),
        link_url: link_url.to_string(),
        name: request.name.trim().to_string(),
    })
}

fn is_acceptable_image(image_url: &str) -> bool {
    let is_data_url = image_url
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"));
    if is_data_url {
        let Some((header, payload)) = image_url[5..].split_once(',') else {
            return false;
        };
        if header.to_ascii_lowercase().ends_with(";base64") {
            return STANDARD.decode(payload.trim()).is_ok();
        }
        return true;
    }
    url::Url::parse(image_url)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
}

/// Decides which cells `request` sells and applies the sale to `document`.
///
/// A live, non-empty reservation is authoritative and the fallback lists are
/// ignored. Otherwise the first non-empty fallback list is filtered down to
/// cells nobody has bought and no other live reservation holds.
pub fn reconcile(
    ctx: &ApiContext,
    document: &mut GridDocument,
    request: &FinalizeRequest,
    artwork: &Artwork,
    now_ms: i64,
) -> Result<Vec<Cell>, ApiError> {
    let reservation = request.reservation();
    let is_sold = |document: &GridDocument, cell: &Cell| {
        document.sold.contains_key(cell) || ctx.is_statically_sold(*cell)
    };

    let reserved = reservation
        .as_ref()
        .and_then(|id| document.live_reservation(id, now_ms))
        .filter(|lock| !lock.blocks.is_empty())
        .map(|lock| lock.blocks.clone());

    let cells: Vec<Cell> = match reserved {
        Some(blocks) => {
            let mut seen = BTreeSet::new();
            let cells: Vec<Cell> = blocks
                .into_iter()
                .filter(|cell| ctx.geometry.contains(*cell) && seen.insert(*cell))
                .filter(|cell| !is_sold(document, cell))
                .collect();
            if cells.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::NoBlocksAvailable,
                    "every reserved cell has already been sold",
                ));
            }
            cells
        }
        None => {
            let candidates = request.fallback_candidates(&ctx.geometry);
            if candidates.is_empty() {
                return Err(match reservation {
                    Some(_) => ApiError::new(
                        ErrorCode::LockNotFoundOrEmpty,
                        "reservation not found, expired or empty",
                    ),
                    None => ApiError::new(ErrorCode::NoBlocksToFinalize, "no blocks supplied"),
                });
            }
            let held_elsewhere = document.locked_by_others(reservation.as_ref(), now_ms);
            let cells: Vec<Cell> = candidates
                .into_iter()
                .filter(|cell| !is_sold(document, cell) && !held_elsewhere.contains(cell))
                .collect();
            if cells.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::NoBlocksAvailable,
                    "all requested cells are sold or reserved by someone else",
                ));
            }
            cells
        }
    };

    let record = artwork.record(now_ms);
    for cell in &cells {
        document.sold.insert(*cell, record.clone());
    }
    if let Some(id) = &reservation {
        document.locks.remove(id);
    }
    Ok(cells)
}

pub async fn finalize(
    ctx: &ApiContext,
    request: FinalizeRequest,
) -> Result<FinalizeSuccess, ApiError> {
    let artwork = validate_artwork(&request)?;

    for attempt in 1..=ctx.finalize_max_attempts {
        let grid = ctx.store.load_grid().await.map_err(store_access)?;
        let mut document = grid.document;
        let sold_blocks = reconcile(ctx, &mut document, &request, &artwork, now_millis())
            .inspect_err(|err| debug!(code = %err.code, "finalize: rejected: {}", err.message))?;

        match ctx
            .store
            .save_grid(&document, grid.version)
            .await
            .map_err(store_save)?
        {
            SaveOutcome::Saved { version } => {
                info!(
                    reservation_id = %request.reservation_id,
                    cells = sold_blocks.len(),
                    version,
                    attempt,
                    "finalize: sold cells"
                );
                return Ok(FinalizeSuccess {
                    ok: true,
                    sold_blocks,
                    art_cells: document.sold,
                });
            }
            SaveOutcome::Conflict => {
                warn!(
                    attempt,
                    read_version = grid.version,
                    "finalize: grid changed while deciding, retrying"
                );
            }
        }
    }

    Err(ApiError::new(
        ErrorCode::StoreSaveError,
        format!(
            "grid kept changing; gave up after {} attempts",
            ctx.finalize_max_attempts
        ),
    ))
}

#[cfg(test)]
#[path = "tests/finalize_tests.rs"]
mod tests;
