use super::*;
use crate::domain::{Region, SoldRecord};

fn record(image: &str, link: &str) -> SoldRecord {
    SoldRecord {
        image_url: image.to_string(),
        link_url: link.to_string(),
        name: String::new(),
        sold_at: 0,
    }
}

fn grid() -> GridState {
    GridState::new(GridGeometry::new(10, 10))
}

#[test]
fn sold_overrides_mine_and_pending() {
    let mut grid = grid();
    grid.claim(&[Cell(4)]);
    grid.mark_pending(&[Cell(5)]);
    assert_eq!(grid.state(Cell(4)), CellState::Mine);
    assert_eq!(grid.state(Cell(5)), CellState::Pending);

    let mut ledger = SoldLedger::new();
    ledger.insert(Cell(4), record("a", "b"));
    ledger.insert(Cell(5), record("a", "b"));
    let repaint = grid.apply_status([Cell(4), Cell(5)], ledger);

    assert_eq!(grid.state(Cell(4)), CellState::Sold);
    assert_eq!(grid.state(Cell(5)), CellState::Sold);
    assert!(repaint.contains(&(Cell(4), CellState::Sold)));
}

#[test]
fn status_diff_repaints_only_changed_cells() {
    let mut grid = grid();
    let first = grid.apply_status([Cell(1), Cell(2)], SoldLedger::new());
    assert_eq!(first, vec![(Cell(1), CellState::Pending), (Cell(2), CellState::Pending)]);

    let second = grid.apply_status([Cell(2), Cell(3)], SoldLedger::new());
    assert_eq!(second, vec![(Cell(1), CellState::Free), (Cell(3), CellState::Pending)]);
}

#[test]
fn my_cells_stay_mine_while_reported_pending() {
    let mut grid = grid();
    grid.claim(&[Cell(7)]);
    let repaint = grid.apply_status([Cell(7)], SoldLedger::new());
    assert!(repaint.is_empty());
    assert_eq!(grid.state(Cell(7)), CellState::Mine);
    assert!(!grid.is_available(Cell(7)));
}

#[test]
fn release_frees_my_cells_even_if_last_poll_reported_them() {
    let mut grid = grid();
    grid.claim(&[Cell(7)]);
    grid.apply_status([Cell(7)], SoldLedger::new());
    let repaint = grid.release(&[Cell(7)]);
    assert_eq!(repaint, vec![(Cell(7), CellState::Free)]);
    assert!(grid.is_available(Cell(7)));
}

#[test]
fn preview_sits_between_mine_and_pending() {
    let mut grid = grid();
    grid.claim(&[Cell(1)]);
    grid.set_preview([Cell(1), Cell(2)]);
    assert_eq!(grid.state(Cell(1)), CellState::Mine);
    assert_eq!(grid.state(Cell(2)), CellState::Preview);

    let (previous, repaint) = grid.take_preview();
    assert_eq!(previous.into_iter().collect::<Vec<_>>(), vec![Cell(1), Cell(2)]);
    assert_eq!(repaint, vec![(Cell(2), CellState::Free)]);
}

#[test]
fn replace_claim_repaints_dropped_and_added_cells() {
    let mut grid = grid();
    grid.claim(&[Cell(1), Cell(2)]);
    let repaint = grid.replace_claim([Cell(2), Cell(3)]);
    assert_eq!(repaint, vec![(Cell(1), CellState::Free), (Cell(3), CellState::Mine)]);
    assert_eq!(grid.claimed_cells(), vec![Cell(2), Cell(3)]);
}

#[test]
fn sold_count_merges_static_regions_and_dynamic_sales() {
    let mut grid = grid();
    grid.load_static(StaticLedger {
        cells: SoldLedger::from([(Cell(0), record("s", "l"))]),
        regions: vec![Region {
            start: Cell(0),
            w: 2,
            h: 2,
            image_url: None,
            link_url: None,
        }],
    });
    assert_eq!(grid.sold_count(), 4);
    assert_eq!(grid.state(Cell(11)), CellState::Sold);

    grid.merge_ledger(SoldLedger::from([
        (Cell(1), record("a", "b")),
        (Cell(50), record("a", "b")),
    ]));
    assert_eq!(grid.sold_count(), 5);
}

#[test]
fn sold_with_art_requires_matching_image_and_link() {
    let mut grid = grid();
    grid.merge_ledger(SoldLedger::from([
        (Cell(1), record("img", "link")),
        (Cell(2), record("img", "other")),
    ]));
    assert_eq!(grid.sold_with_art(&[Cell(1), Cell(2), Cell(3)], "img", "link"), 1);
}

#[test]
fn cells_off_the_grid_are_ignored() {
    let mut grid = grid();
    assert!(grid.claim(&[Cell(100)]).is_empty());
    assert!(grid.mine().is_empty());
    assert_eq!(grid.state(Cell(100)), CellState::Free);
}

#[test]
fn clear_preview_repaints_free() {
    let mut grid = grid();
    grid.set_preview([Cell(8)]);
    assert_eq!(grid.clear_preview(), vec![(Cell(8), CellState::Free)]);
    assert!(grid.preview().is_empty());
}
