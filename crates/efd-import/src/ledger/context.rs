//! Cross-line state of a ledger stream
//!
//! The context is threaded through every decoded line and doubles as the
//! resume checkpoint: its serialized form is stored in the job record at the
//! end of every slice and rehydrated at the start of the next one. Everything
//! that changes how a later line decodes is carried over: the declared partner
//! codes, the establishment codes, the branch-identity cache and any open
//! aggregate slots. Only the job's own branch is taken from the job record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{Family, LedgerRecord};

/// The two sibling layouts of the ledger file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatVariant {
    /// Contributions layout: transport and telecom sub-totals arrive in
    /// auxiliary records after the document
    Contributions,
    /// ICMS/IPI layout: every document carries its sub-totals inline
    IcmsIpi,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingContext {
    pub period: Option<NaiveDate>,
    pub entity_document: Option<String>,
    pub entity_name: Option<String>,
    pub branch_id: Option<Uuid>,
    pub variant: Option<FormatVariant>,

    /// Open aggregate slots, at most one per family
    #[serde(default)]
    pub pending: Vec<LedgerRecord>,

    /// Branch identities by document number
    #[serde(default)]
    pub branches: BTreeMap<String, Uuid>,

    /// Branch fixed by the job itself, if any
    #[serde(skip)]
    pub default_branch: Option<Uuid>,

    /// Partner codes declared by `0150` records so far
    #[serde(default)]
    pub partners: BTreeSet<String>,

    /// Establishment document -> external code, from `0140` records so far
    #[serde(default)]
    pub establishments: BTreeMap<String, String>,
}

impl ProcessingContext {
    /// Rehydrate from a checkpoint, or start fresh when there is none
    pub fn restore(snapshot: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        match snapshot {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn with_default_branch(mut self, branch_id: Option<Uuid>) -> Self {
        self.default_branch = branch_id;
        self
    }

    /// Merge persisted branch identities; entries already cached win
    pub fn load_branches(&mut self, known: impl IntoIterator<Item = (String, Uuid)>) {
        for (document, id) in known {
            self.branches.entry(document).or_insert(id);
        }
    }

    pub fn activate_branch(&mut self, document: &str, id: Uuid) {
        self.branches.insert(document.to_string(), id);
        self.branch_id = Some(id);
    }

    /// A partner code can be used as-is when it is non-empty and, once the
    /// file has declared any partner, declared among them
    pub fn resolvable_partner(&self, code: &str) -> bool {
        !code.is_empty() && (self.partners.is_empty() || self.partners.contains(code))
    }

    pub fn declare_partner(&mut self, code: &str) {
        self.partners.insert(code.to_string());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending(&mut self, family: Family) -> Option<LedgerRecord> {
        let index = self.pending.iter().position(|slot| slot.family == family)?;
        Some(self.pending.remove(index))
    }

    pub fn pending_mut(&mut self, family: Family) -> Option<&mut LedgerRecord> {
        self.pending.iter_mut().find(|slot| slot.family == family)
    }

    /// Park a primary record; the caller closes any previous slot of the family first
    pub fn open_pending(&mut self, record: LedgerRecord) {
        debug_assert!(self.pending_mut(record.family).is_none());
        self.pending.push(record);
    }

    pub fn drain_pending(&mut self) -> Vec<LedgerRecord> {
        std::mem::take(&mut self.pending)
    }
}
