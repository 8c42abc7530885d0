//! Line classification
//!
//! Maps a raw ledger line to one of the record kinds the importer understands.
//! Classification never fails: lines that are not records, carry an unknown
//! tag, have too few fields for their kind, or belong to a family outside the
//! job's import scope are simply not classified.

use std::fmt;

use efd_common::text::split_fields;
use tracing::warn;

use super::models::Family;

/// Closed set of record kinds handled by the decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// `0000`: fiscal period, declaring entity and layout variant
    Header,
    /// `0140`: establishment registry
    Establishment,
    /// `0150`: counterparty registry
    Partner,
    /// `A010`, `C010`, `D010`, `F010`: following lines pertain to this entity
    EntitySwitch,
    /// `C100`
    GoodsDocument,
    /// `C500`
    UtilityInvoice,
    /// `A100`
    ServiceInvoice,
    /// `D100`
    FreightDocument,
    /// `D101`
    FreightPis,
    /// `D105`
    FreightCofins,
    /// `D500`
    TelecomDocument,
    /// `D501`
    TelecomPis,
    /// `D505`
    TelecomCofins,
}

impl RecordKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "0000" => RecordKind::Header,
            "0140" => RecordKind::Establishment,
            "0150" => RecordKind::Partner,
            "A010" | "C010" | "D010" | "F010" => RecordKind::EntitySwitch,
            "C100" => RecordKind::GoodsDocument,
            "C500" => RecordKind::UtilityInvoice,
            "A100" => RecordKind::ServiceInvoice,
            "D100" => RecordKind::FreightDocument,
            "D101" => RecordKind::FreightPis,
            "D105" => RecordKind::FreightCofins,
            "D500" => RecordKind::TelecomDocument,
            "D501" => RecordKind::TelecomPis,
            "D505" => RecordKind::TelecomCofins,
            _ => return None,
        };
        Some(kind)
    }

    /// Minimum number of split fields (including the empty leading and
    /// trailing ones) a line needs before the decoder will look at it
    pub fn min_fields(self) -> usize {
        match self {
            RecordKind::Header => 6,
            RecordKind::Establishment => 6,
            RecordKind::Partner => 5,
            RecordKind::EntitySwitch => 4,
            RecordKind::GoodsDocument => 14,
            RecordKind::UtilityInvoice => 12,
            RecordKind::ServiceInvoice => 14,
            RecordKind::FreightDocument => 17,
            RecordKind::FreightPis | RecordKind::FreightCofins => 10,
            RecordKind::TelecomDocument => 14,
            RecordKind::TelecomPis | RecordKind::TelecomCofins => 9,
        }
    }

    /// Family of movement records this kind produces or completes
    pub fn family(self) -> Option<Family> {
        match self {
            RecordKind::GoodsDocument => Some(Family::Goods),
            RecordKind::UtilityInvoice => Some(Family::Utility),
            RecordKind::ServiceInvoice => Some(Family::Service),
            RecordKind::FreightDocument | RecordKind::FreightPis | RecordKind::FreightCofins => {
                Some(Family::Freight)
            },
            RecordKind::TelecomDocument | RecordKind::TelecomPis | RecordKind::TelecomCofins => {
                Some(Family::Telecom)
            },
            RecordKind::Header
            | RecordKind::Establishment
            | RecordKind::Partner
            | RecordKind::EntitySwitch => None,
        }
    }

    /// Sub-total records that only complete an open aggregate
    pub fn is_auxiliary(self) -> bool {
        matches!(
            self,
            RecordKind::FreightPis
                | RecordKind::FreightCofins
                | RecordKind::TelecomPis
                | RecordKind::TelecomCofins
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Header => "header",
            RecordKind::Establishment => "establishment",
            RecordKind::Partner => "partner",
            RecordKind::EntitySwitch => "entity_switch",
            RecordKind::GoodsDocument => "goods_document",
            RecordKind::UtilityInvoice => "utility_invoice",
            RecordKind::ServiceInvoice => "service_invoice",
            RecordKind::FreightDocument => "freight_document",
            RecordKind::FreightPis => "freight_pis",
            RecordKind::FreightCofins => "freight_cofins",
            RecordKind::TelecomDocument => "telecom_document",
            RecordKind::TelecomPis => "telecom_pis",
            RecordKind::TelecomCofins => "telecom_cofins",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which movement families a job imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportScope {
    #[default]
    All,
    /// Goods, utility and service documents
    Movements,
    /// Freight and telecom documents with their sub-totals
    Transport,
}

impl ImportScope {
    /// Lenient parse of the job's `import_scope` column; unknown values import everything
    pub fn from_job(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "" | "all" | "everything" | "full" => ImportScope::All,
            "movements" => ImportScope::Movements,
            "transport" => ImportScope::Transport,
            other => {
                warn!(scope = other, "Unknown import scope, importing everything");
                ImportScope::All
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportScope::All => "all",
            ImportScope::Movements => "movements",
            ImportScope::Transport => "transport",
        }
    }

    pub fn allows(&self, family: Family) -> bool {
        match self {
            ImportScope::All => true,
            ImportScope::Movements => {
                matches!(family, Family::Goods | Family::Utility | Family::Service)
            },
            ImportScope::Transport => matches!(family, Family::Freight | Family::Telecom),
        }
    }

    /// Registry and structural kinds are always active
    pub fn allows_kind(&self, kind: RecordKind) -> bool {
        kind.family().map_or(true, |family| self.allows(family))
    }
}

/// A classified line with its split fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified<'a> {
    pub kind: RecordKind,
    pub fields: Vec<&'a str>,
}

/// Tag of a `|TAG|...` line without splitting the rest of it
pub fn line_tag(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('|')?;
    let end = rest.find('|')?;
    let tag = &rest[..end];
    (!tag.is_empty()).then_some(tag)
}

/// Classify a decoded line for the given scope
pub fn classify(line: &str, scope: ImportScope) -> Option<Classified<'_>> {
    let kind = RecordKind::from_tag(line_tag(line)?)?;
    if !scope.allows_kind(kind) {
        return None;
    }

    let fields = split_fields(line)?;
    if fields.len() < kind.min_fields() {
        return None;
    }

    Some(Classified { kind, fields })
}
