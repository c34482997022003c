use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{now_millis, Cell, GridGeometry, Reservation, ReservationId, StaticLedger},
    pricing::{quote, sold_count, unit_price},
};
use storage::{GridStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/grid.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the sold ledger and live reservations as JSON.
    ShowLedger,
    /// Seed a reservation, e.g. to test finalize by hand.
    Reserve {
        #[arg(required = true)]
        blocks: Vec<u32>,
        /// Lifetime in seconds; omit for a reservation that never expires.
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
    Release { reservation_id: String },
    /// Current unit price and what `cells` more would cost.
    Price {
        #[arg(long, default_value_t = 1)]
        cells: u64,
        #[arg(long, default_value_t = 100)]
        width: u32,
        #[arg(long, default_value_t = 100)]
        height: u32,
        /// Static sales file the server is deployed with; its cells count as sold.
        #[arg(long)]
        static_ledger: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ShowLedger => {
            let grid = storage.load_grid().await?;
            println!("version={}", grid.version);
            println!("{}", serde_json::to_string_pretty(&grid.document)?);
        }
        Command::Reserve { blocks, ttl_secs } => {
            let id = ReservationId::generate();
            let reservation = Reservation {
                blocks: blocks.into_iter().map(Cell).collect(),
                expires_at: ttl_secs.map(|secs| now_millis() + secs * 1000),
            };
            storage.put_reservation(&id, reservation).await?;
            println!("reserved reservation_id={id}");
        }
        Command::Release { reservation_id } => {
            let Some(id) = ReservationId::parse(&reservation_id) else {
                bail!("reservation id must not be blank");
            };
            if storage.remove_reservation(&id).await? {
                println!("released reservation_id={id}");
            } else {
                println!("no reservation_id={id}");
            }
        }
        Command::Price {
            cells,
            width,
            height,
            static_ledger,
        } => {
            let geometry = GridGeometry::checked(width, height)
                .context("grid width and height must be positive and fit u32 cell ids")?;
            let static_ledger = match static_ledger {
                Some(path) => {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("failed to read '{}'", path.display()))?;
                    StaticLedger::from_json(&raw)
                        .with_context(|| format!("'{}' is not a static ledger", path.display()))?
                }
                None => StaticLedger::default(),
            };
            let grid = storage.load_grid().await?;
            let sold = sold_count(
                &geometry,
                &static_ledger.covered_cells(&geometry),
                &grid.document.sold,
            );
            println!(
                "sold={sold} unit={} quote({cells})={}",
                unit_price(sold),
                quote(sold, cells)
            );
        }
    }

    Ok(())
}
