//! Bulk ingest: lot CSVs and uploaded image filenames.
//!
//! CSV batches are all-or-nothing: one bad row or duplicate lot number and
//! nothing is inserted; the batch record carries every row error so the
//! operator can fix the file in one pass. Image matching is per-file: each
//! upload lands as matched, unmatched or conflict, and admins can repair the
//! leftovers by hand.

use std::collections::{BTreeSet, HashSet};

use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use shared::rules::parse_image_filename;
use shared::types::{
    AuctionId, AuctionStatus, BatchId, BatchKind, BatchOutcome, ImageMapping, ImportBatch, Lot,
    LotId, LotStatus, MappingId, MappingStatus, RowError,
};

use crate::engine::Engine;
use crate::error::{EngineError, ResultCode};

const REQUIRED_COLUMNS: &[&str] = &["lot_number", "title", "starting_bid"];

#[derive(Debug)]
pub struct CsvImportReport {
    pub batch: ImportBatch,
    /// Inserted lots; empty when the batch was rejected.
    pub lots: Vec<Lot>,
}

#[derive(Debug, Clone)]
pub struct ImageFile {
    pub filename: String,
    pub stored_url: String,
}

pub struct ImageMatchReport {
    pub batch: ImportBatch,
    pub mappings: Vec<ImageMapping>,
}

impl Engine {
    /// Parse and apply a lot CSV. A malformed header (or non-UTF-8 payload)
    /// is refused outright; row-level problems reject the batch but still
    /// record it, errors and all.
    #[instrument(skip(self, csv), fields(auction = %auction_id, bytes = csv.len()))]
    pub fn import_lots_csv(
        &self,
        auction_id: AuctionId,
        csv: &[u8],
    ) -> Result<CsvImportReport, EngineError> {
        let auction = self.store.auction(auction_id)?;
        if !matches!(
            auction.status,
            AuctionStatus::Draft | AuctionStatus::Published
        ) {
            return Err(EngineError::rejected(
                ResultCode::Conflict,
                "lots can only be imported before the auction runs",
            ));
        }

        let text = std::str::from_utf8(csv).map_err(|_| {
            EngineError::rejected(ResultCode::InvalidCsv, "file is not valid UTF-8")
        })?;
        let mut rows = parse_csv(text);
        if rows.is_empty() {
            return Err(EngineError::rejected(ResultCode::InvalidCsv, "file is empty"));
        }
        let header: Vec<String> = rows
            .remove(0)
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        for required in REQUIRED_COLUMNS {
            if !header.iter().any(|h| h == required) {
                return Err(EngineError::rejected(
                    ResultCode::InvalidCsv,
                    format!("missing required column {required}"),
                ));
            }
        }
        let column = |name: &str| header.iter().position(|h| h == name);

        let now = self.clock.now();
        let mut errors = Vec::new();
        let mut seen_numbers: BTreeSet<u32> = BTreeSet::new();
        let mut lots = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            let row_no = index as u32 + 1;
            let field = |name: &str| -> Option<String> {
                column(name)
                    .and_then(|i| row.get(i))
                    .map(|v| v.trim().to_string())
            };
            let mut push_err = |field: &str, message: String| {
                errors.push(RowError {
                    row: row_no,
                    field: Some(field.into()),
                    message,
                });
            };

            let lot_number = match field("lot_number").filter(|v| !v.is_empty()) {
                Some(v) => match v.parse::<u32>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        push_err("lot_number", format!("not an integer: {v:?}"));
                        None
                    }
                },
                None => {
                    push_err("lot_number", "missing".into());
                    None
                }
            };
            let title = match field("title").filter(|v| !v.is_empty()) {
                Some(v) => Some(v),
                None => {
                    push_err("title", "missing".into());
                    None
                }
            };
            let starting_bid = match field("starting_bid").filter(|v| !v.is_empty()) {
                Some(v) => match v.parse::<Decimal>() {
                    Ok(d) if d >= Decimal::ZERO => Some(d),
                    Ok(_) => {
                        push_err("starting_bid", "must not be negative".into());
                        None
                    }
                    Err(_) => {
                        push_err("starting_bid", format!("not a number: {v:?}"));
                        None
                    }
                },
                None => {
                    push_err("starting_bid", "missing".into());
                    None
                }
            };
            let reserve_price = parse_optional_decimal(field("reserve_price"), "reserve_price", &mut push_err);
            let buy_now_price = parse_optional_decimal(field("buy_now_price"), "buy_now_price", &mut push_err);
            let quantity = match field("quantity").filter(|v| !v.is_empty()) {
                Some(v) => match v.parse::<u32>() {
                    Ok(n) => n,
                    Err(_) => {
                        push_err("quantity", format!("not an integer: {v:?}"));
                        1
                    }
                },
                None => 1,
            };
            let shipping_available = match field("shipping_available")
                .filter(|v| !v.is_empty())
                .map(|v| v.to_ascii_lowercase())
            {
                None => false,
                Some(v) if v == "true" || v == "1" => true,
                Some(v) if v == "false" || v == "0" => false,
                Some(v) => {
                    push_err("shipping_available", format!("expected true/false/1/0, got {v:?}"));
                    false
                }
            };
            let tags: Vec<String> = field("tags")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            if let Some(number) = lot_number {
                if !seen_numbers.insert(number) {
                    push_err("lot_number", format!("duplicate lot number {number} in file"));
                } else if self.store.lot_by_number(auction_id, number).is_some() {
                    push_err(
                        "lot_number",
                        format!("lot number {number} already exists in auction"),
                    );
                }
            }

            if let (Some(lot_number), Some(title), Some(starting_bid)) =
                (lot_number, title, starting_bid)
            {
                lots.push(Lot {
                    id: Uuid::new_v4(),
                    auction_id,
                    lot_number,
                    title,
                    description: field("description").filter(|v| !v.is_empty()),
                    category: field("category").filter(|v| !v.is_empty()),
                    condition: field("condition").filter(|v| !v.is_empty()),
                    starting_bid,
                    reserve_price,
                    buy_now_price,
                    increment_rules_override: None,
                    shipping_amount: Decimal::ZERO,
                    quantity,
                    location: field("location").filter(|v| !v.is_empty()),
                    shipping_available,
                    tags,
                    original_close_at: auction.end_at,
                    current_close_at: auction.end_at,
                    extension_count: 0,
                    status: LotStatus::Pending,
                    current_bid: Decimal::ZERO,
                    current_bidder_id: None,
                    bid_count: 0,
                    reserve_met: false,
                    closed_at: None,
                    created_at: now,
                });
            }
        }

        let total_rows = rows.len() as u32;
        let batch = if errors.is_empty() {
            self.store.insert_lots(auction_id, lots.clone())?;
            ImportBatch {
                id: Uuid::new_v4(),
                auction_id,
                kind: BatchKind::LotCsv,
                outcome: BatchOutcome::Applied,
                total_rows,
                applied_rows: lots.len() as u32,
                errors: Vec::new(),
                created_at: now,
            }
        } else {
            lots.clear();
            ImportBatch {
                id: Uuid::new_v4(),
                auction_id,
                kind: BatchKind::LotCsv,
                outcome: BatchOutcome::Rejected,
                total_rows,
                applied_rows: 0,
                errors,
                created_at: now,
            }
        };
        self.store.insert_batch(batch.clone())?;
        info!(batch = %batch.id, outcome = ?batch.outcome, rows = total_rows, "lot csv processed");
        Ok(CsvImportReport { batch, lots })
    }

    /// Match uploaded image filenames against the auction's lots. The first
    /// file to claim a `(lot, photo_order)` slot wins; later claimants land
    /// as conflicts for manual repair.
    #[instrument(skip(self, files), fields(auction = %auction_id, files = files.len()))]
    pub fn match_images(
        &self,
        auction_id: AuctionId,
        files: Vec<ImageFile>,
    ) -> Result<ImageMatchReport, EngineError> {
        self.store.auction(auction_id)?;
        let now = self.clock.now();
        let batch_id = Uuid::new_v4();

        let mut claimed: HashSet<(LotId, u32)> = HashSet::new();
        let mut mappings = Vec::with_capacity(files.len());
        for file in files {
            let mut mapping = ImageMapping {
                id: Uuid::new_v4(),
                batch_id,
                auction_id,
                filename: file.filename.clone(),
                stored_url: file.stored_url,
                lot_id: None,
                photo_order: None,
                status: MappingStatus::Unmatched,
                reason: None,
                created_at: now,
            };
            match parse_image_filename(&file.filename) {
                None => {
                    mapping.reason = Some("unparseable".into());
                }
                Some((lot_number, order)) => {
                    match self.store.lot_by_number(auction_id, lot_number) {
                        None => {
                            mapping.reason = Some("no lot".into());
                        }
                        Some(lot) => {
                            mapping.lot_id = Some(lot.id);
                            mapping.photo_order = Some(order);
                            let slot = (lot.id, order);
                            if claimed.contains(&slot) || self.store.photo_slot_taken(lot.id, order)
                            {
                                mapping.status = MappingStatus::Conflict;
                                mapping.reason = Some("slot already assigned".into());
                            } else {
                                claimed.insert(slot);
                                mapping.status = MappingStatus::Matched;
                            }
                        }
                    }
                }
            }
            mappings.push(mapping);
        }

        self.store.insert_mappings(mappings.clone())?;
        let matched = mappings
            .iter()
            .filter(|m| m.status == MappingStatus::Matched)
            .count() as u32;
        let batch = ImportBatch {
            id: batch_id,
            auction_id,
            kind: BatchKind::Images,
            outcome: BatchOutcome::Applied,
            total_rows: mappings.len() as u32,
            applied_rows: matched,
            errors: Vec::new(),
            created_at: now,
        };
        self.store.insert_batch(batch.clone())?;
        Ok(ImageMatchReport { batch, mappings })
    }

    /// Admin repair of an unmatched or conflicted mapping.
    pub fn manual_assign(
        &self,
        mapping_id: MappingId,
        lot_id: LotId,
        order: u32,
    ) -> Result<ImageMapping, EngineError> {
        Ok(self.store.assign_mapping(mapping_id, lot_id, order)?)
    }

    pub fn import_batch(&self, id: BatchId) -> Result<ImportBatch, EngineError> {
        Ok(self.store.batch(id)?)
    }

    pub fn batch_mappings(&self, batch_id: BatchId) -> Vec<ImageMapping> {
        self.store.mappings_of_batch(batch_id)
    }
}

fn parse_optional_decimal(
    value: Option<String>,
    name: &str,
    push_err: &mut impl FnMut(&str, String),
) -> Option<Decimal> {
    let value = value.filter(|v| !v.is_empty())?;
    match value.parse::<Decimal>() {
        Ok(d) => Some(d),
        Err(_) => {
            push_err(name, format!("not a number: {value:?}"));
            None
        }
    }
}

/// Minimal quote-aware CSV reader: comma separators, `""` escaping inside
/// quoted fields, CRLF or LF row endings. Returns rows of raw fields;
/// entirely empty trailing lines are dropped.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    rows
}
