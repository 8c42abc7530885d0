//! Buffered, deduplicating writes into a [`RecordSink`]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use tracing::{debug, warn};

use super::sink::{RecordSink, RowBatch, WriteScope};
use crate::error::WriteError;
use crate::ledger::{CounterpartyRow, Destination, Family, LedgerRecord, Row};

/// Per-destination buffers flushed at a fixed size.
///
/// Counterparties are always flushed before any ledger family so movement
/// rows never reach the store ahead of the counterparties they reference.
pub struct BatchPersister<'s> {
    sink: &'s dyn RecordSink,
    scope: WriteScope,
    batch_size: usize,
    counterparties: Vec<CounterpartyRow>,
    ledger: BTreeMap<Family, Vec<LedgerRecord>>,
    /// Destinations that turned out to lack a uniqueness constraint
    fallback: HashSet<Destination>,
    written: BTreeMap<String, u64>,
}

impl<'s> BatchPersister<'s> {
    pub fn new(sink: &'s dyn RecordSink, scope: WriteScope, batch_size: usize) -> Self {
        Self {
            sink,
            scope,
            batch_size: batch_size.max(1),
            counterparties: Vec::new(),
            ledger: BTreeMap::new(),
            fallback: HashSet::new(),
            written: BTreeMap::new(),
        }
    }

    pub async fn push(&mut self, row: Row) -> Result<(), WriteError> {
        match row {
            Row::Counterparty(row) => self.push_counterparty(row).await,
            Row::Ledger(record) => self.push_ledger(record).await,
        }
    }

    pub async fn push_counterparty(&mut self, row: CounterpartyRow) -> Result<(), WriteError> {
        self.counterparties.push(row);
        if self.counterparties.len() >= self.batch_size {
            self.flush_counterparties().await?;
        }
        Ok(())
    }

    pub async fn push_ledger(&mut self, record: LedgerRecord) -> Result<(), WriteError> {
        let family = record.family;
        let buffer = self.ledger.entry(family).or_default();
        buffer.push(record);

        if buffer.len() >= self.batch_size {
            self.flush_counterparties().await?;
            self.flush_family(family).await?;
        }
        Ok(())
    }

    /// Rows buffered but not yet written
    pub fn buffered(&self) -> usize {
        self.counterparties.len() + self.ledger.values().map(Vec::len).sum::<usize>()
    }

    /// Flush every buffer, counterparties first
    pub async fn flush_all(&mut self) -> Result<(), WriteError> {
        self.flush_counterparties().await?;
        for family in Family::ALL {
            self.flush_family(family).await?;
        }
        Ok(())
    }

    /// Rows written so far, by destination table
    pub fn written(&self) -> &BTreeMap<String, u64> {
        &self.written
    }

    async fn flush_counterparties(&mut self) -> Result<(), WriteError> {
        if self.counterparties.is_empty() {
            return Ok(());
        }

        let rows = dedup_last_wins(std::mem::take(&mut self.counterparties), |row| {
            row.code.clone()
        });
        self.write(RowBatch::Counterparties(&rows)).await
    }

    async fn flush_family(&mut self, family: Family) -> Result<(), WriteError> {
        let rows = match self.ledger.get_mut(&family) {
            Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
            _ => return Ok(()),
        };

        let rows = dedup_last_wins(rows, LedgerRecord::dedup_key);
        self.write(RowBatch::Ledger(family, &rows)).await
    }

    async fn write(&mut self, batch: RowBatch<'_>) -> Result<(), WriteError> {
        let destination = batch.destination();
        let table = destination.table();

        let count = if self.fallback.contains(&destination) {
            self.sink.insert(&self.scope, batch).await?
        } else {
            match self.sink.upsert(&self.scope, batch).await {
                Ok(count) => count,
                Err(WriteError::MissingConstraint(_)) => {
                    warn!(
                        table,
                        "Destination has no uniqueness constraint, falling back to plain insert"
                    );
                    self.fallback.insert(destination);
                    self.sink.insert(&self.scope, batch).await?
                },
                Err(err) => return Err(err),
            }
        };

        debug!(table, rows = batch.len(), written = count, "Batch flushed");
        *self.written.entry(table.to_string()).or_insert(0) += count;
        Ok(())
    }
}

/// Keep the last occurrence of every key, preserving the order of survivors
fn dedup_last_wins<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let keys: Vec<K> = rows.iter().map(&key).collect();
    let mut last: HashMap<&K, usize> = HashMap::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        last.insert(key, index);
    }

    let survivors: Vec<bool> = keys
        .iter()
        .enumerate()
        .map(|(index, key)| last.get(key) == Some(&index))
        .collect();

    rows.into_iter()
        .zip(survivors)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect()
}
