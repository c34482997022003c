use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{Cell, GridGeometry, ReservationId, SoldLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOp {
    Add,
    Remove,
}

/// Body accepted by the lock service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub op: LockOp,
    pub blocks: Vec<Cell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
}

/// Lock service answer: the reservation that now holds my cells, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    #[serde(default)]
    pub reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub blocks: Option<Vec<Cell>>,
}

impl LockResponse {
    pub fn live_reservation(&self) -> Option<ReservationId> {
        self.reservation_id
            .as_ref()
            .and_then(|id| ReservationId::parse(id.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub reservation_id: ReservationId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub pending: Vec<Cell>,
    #[serde(default)]
    pub art_cells: SoldLedger,
}

/// Finalize body. Parsing is deliberately loose: absent, null and mistyped
/// fields read as empty, and block ids are validated later against the grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub reservation_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub image_url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub link_url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_list")]
    pub blocks: Vec<serde_json::Value>,
    #[serde(default, alias = "blocksCsv", deserialize_with = "lenient_string")]
    pub block_index: String,
}

impl FinalizeRequest {
    /// Request for a client claim, carrying both fallback encodings.
    pub fn for_claim(
        reservation_id: Option<&ReservationId>,
        image_url: impl Into<String>,
        link_url: impl Into<String>,
        name: impl Into<String>,
        blocks: &[Cell],
    ) -> Self {
        Self {
            reservation_id: reservation_id.map(|id| id.0.clone()).unwrap_or_default(),
            image_url: image_url.into(),
            link_url: link_url.into(),
            name: name.into(),
            blocks: blocks.iter().map(|cell| serde_json::Value::from(cell.0)).collect(),
            block_index: blocks
                .iter()
                .map(|cell| cell.0.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn reservation(&self) -> Option<ReservationId> {
        ReservationId::parse(&self.reservation_id)
    }

    pub fn listed_blocks(&self, geometry: &GridGeometry) -> Vec<Cell> {
        dedup_in_order(self.blocks.iter().filter_map(|value| geometry.parse_cell(value)))
    }

    /// Fallback candidates: the structured list if it has any valid ids, else the delimited string.
    pub fn fallback_candidates(&self, geometry: &GridGeometry) -> Vec<Cell> {
        let listed = self.listed_blocks(geometry);
        if !listed.is_empty() {
            return listed;
        }
        parse_block_index(&self.block_index, geometry)
    }
}

/// Parses `"1, 2;3 4"` style block lists, keeping the first occurrence of each valid id.
pub fn parse_block_index(raw: &str, geometry: &GridGeometry) -> Vec<Cell> {
    dedup_in_order(
        raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .filter_map(|part| {
                geometry.parse_cell(&serde_json::Value::String(part.to_string()))
            }),
    )
}

fn dedup_in_order(cells: impl Iterator<Item = Cell>) -> Vec<Cell> {
    let mut seen = BTreeSet::new();
    cells.filter(|cell| seen.insert(*cell)).collect()
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Array(items) => items,
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSuccess {
    pub ok: bool,
    pub sold_blocks: Vec<Cell>,
    pub art_cells: SoldLedger,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
