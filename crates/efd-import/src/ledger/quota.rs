//! Per-family import caps

use std::collections::BTreeMap;

use super::classifier::ImportScope;
use super::models::Family;

/// Limit value meaning "no cap"
pub const UNBOUNDED: i64 = 0;

/// Limit value meaning "family disabled for this job"
pub const DISABLED: i64 = -1;

/// Running counters and limits for every movement family.
///
/// A limit of [`UNBOUNDED`] never stops the family, a negative limit rejects
/// every record, a positive limit admits exactly that many records across
/// all slices of the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQuotas {
    limits: BTreeMap<Family, i64>,
    used: BTreeMap<Family, u64>,
}

impl BlockQuotas {
    /// Families inside the scope get `record_limit`; the rest are disabled
    pub fn for_scope(scope: ImportScope, record_limit: i64) -> Self {
        let limit = record_limit.max(UNBOUNDED);
        let limits = Family::ALL
            .iter()
            .map(|family| {
                let value = if scope.allows(*family) { limit } else { DISABLED };
                (*family, value)
            })
            .collect();

        Self {
            limits,
            used: BTreeMap::new(),
        }
    }

    /// Resume with counters persisted by earlier slices
    pub fn with_used(mut self, used: &BTreeMap<Family, u64>) -> Self {
        self.used = used.clone();
        self
    }

    pub fn limit(&self, family: Family) -> i64 {
        self.limits.get(&family).copied().unwrap_or(DISABLED)
    }

    pub fn used(&self) -> &BTreeMap<Family, u64> {
        &self.used
    }

    /// Whether the family has room for one more record
    pub fn has_room(&self, family: Family) -> bool {
        let limit = self.limit(family);
        let used = self.used.get(&family).copied().unwrap_or(0);
        match limit {
            l if l < 0 => false,
            UNBOUNDED => true,
            l => used < l as u64,
        }
    }

    /// Count one record against the family, refusing it when the family is full or disabled
    pub fn try_take(&mut self, family: Family) -> bool {
        if !self.has_room(family) {
            return false;
        }
        *self.used.entry(family).or_insert(0) += 1;
        true
    }

    /// True once every family with a positive limit has reached it.
    ///
    /// Jobs without any positive limit are never exhausted.
    pub fn exhausted(&self) -> bool {
        let mut bounded = self.limits.iter().filter(|(_, limit)| **limit > 0).peekable();
        if bounded.peek().is_none() {
            return false;
        }
        bounded.all(|(family, limit)| self.used.get(family).copied().unwrap_or(0) >= *limit as u64)
    }
}
