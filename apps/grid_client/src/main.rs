use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    HttpGridBackend, JsonFileSelectionStore, PurchaseForm, SelectionController, SelectionEvent,
    STATUS_POLL_INTERVAL,
};
use shared::{
    domain::{Cell, GridGeometry, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH},
    grid::CellState,
    pricing::{cell_price, pixels_left, quote, unit_price},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const UNLOAD_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server_url: String,
    /// Where the current claim survives between runs.
    #[arg(long, default_value = ".grid_selection.json")]
    state_file: PathBuf,
    #[arg(long, default_value_t = DEFAULT_GRID_WIDTH)]
    width: u32,
    #[arg(long, default_value_t = DEFAULT_GRID_HEIGHT)]
    height: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Current price, pixels left and my claim.
    Status,
    /// Offline quote for `cells` cells after `sold` sales.
    Price {
        #[arg(long)]
        sold: u64,
        #[arg(long, default_value_t = 1)]
        cells: u64,
    },
    /// Toggle single cells in or out of my claim.
    Claim { cells: Vec<u32> },
    /// Claim the rectangle spanned by two corner cells.
    Drag { from: u32, to: u32 },
    Buy {
        #[arg(long)]
        image_url: String,
        #[arg(long)]
        link_url: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Give the claim back.
    Cancel,
    /// Poll status and print repaints until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();
    let geometry = GridGeometry::checked(args.width, args.height)
        .context("grid width and height must be positive and fit u32 cell ids")?;

    if let Command::Price { sold, cells } = args.command {
        print_quote(&geometry, sold, cells);
        return Ok(());
    }

    let mut controller = SelectionController::new(
        Arc::new(HttpGridBackend::new(args.server_url.as_str())),
        Box::new(JsonFileSelectionStore::new(args.state_file.clone())),
        geometry,
    );
    controller.restore().await;

    match args.command {
        Command::Status | Command::Price { .. } => {}
        Command::Claim { cells } => {
            for cell in cells {
                match controller.toggle(Cell(cell)).await {
                    Ok(outcome) => println!("cell {cell}: {outcome:?}"),
                    Err(err) => println!("cell {cell}: {err}"),
                }
            }
        }
        Command::Drag { from, to } => {
            controller.begin_drag(Cell(from));
            controller.drag_to(Cell(to));
            controller.animation_frame();
            let claimed = controller.end_drag().await?;
            println!("claimed {} cells", claimed.len());
        }
        Command::Buy {
            image_url,
            link_url,
            name,
        } => {
            let outcome = controller
                .submit_purchase(PurchaseForm {
                    image_url,
                    link_url,
                    name,
                })
                .await?;
            println!(
                "bought {} cells ({:?})",
                outcome.cells.len(),
                outcome.confirmation
            );
        }
        Command::Cancel => {
            controller.cancel().await;
            println!("claim released");
        }
        Command::Watch => {
            watch(&mut controller).await?;
            return Ok(());
        }
    }

    print_summary(&controller);
    Ok(())
}

async fn watch(controller: &mut SelectionController) -> Result<()> {
    let mut events = controller.subscribe();
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    info!(interval_ms = STATUS_POLL_INTERVAL.as_millis() as u64, "watching grid");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.on_page_unload();
                // Give the fire-and-forget release a moment to reach the wire.
                tokio::time::sleep(UNLOAD_GRACE).await;
                return Ok(());
            }
            _ = ticker.tick() => {
                controller.poll_status().await;
                while let Ok(event) = events.try_recv() {
                    if let SelectionEvent::Repainted(repaint) = event {
                        for (cell, state) in repaint {
                            println!("{} -> {}", cell.0, label(state));
                        }
                    }
                }
            }
        }
    }
}

fn label(state: CellState) -> &'static str {
    match state {
        CellState::Free => "free",
        CellState::Pending => "pending",
        CellState::Mine => "mine",
        CellState::Sold => "sold",
        CellState::Preview => "preview",
    }
}

fn print_quote(geometry: &GridGeometry, sold: u64, cells: u64) {
    println!(
        "unit {} / cell {} / {} cells {} / {} pixels left",
        unit_price(sold),
        cell_price(sold),
        cells,
        quote(sold, cells),
        pixels_left(geometry, sold)
    );
}

fn print_summary(controller: &SelectionController) {
    let summary = controller.summary();
    println!(
        "unit price {} | pixels left {} | claim {} cells ({} px) = {}",
        summary.unit_price, summary.pixels_left, summary.cells, summary.pixels, summary.total
    );
    if let Some(id) = controller.reservation_id() {
        println!("reservation {id}");
    }
    if controller.purchase_committed() {
        println!("purchase committed");
    }
}
