//! Business rows produced by the ledger decoders

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use efd_common::checksum::natural_key;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counterparty code assigned to inbound movements without a resolvable partner
pub const UNIDENTIFIED_SUPPLIER: &str = "FORNECEDOR_NAO_IDENTIFICADO";

/// Counterparty code assigned to outbound movements without a resolvable partner
pub const FINAL_CONSUMER: &str = "CONSUMIDOR_FINAL";

/// Direction of a movement from the declaring entity's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// `IND_OPER` field: `0` inbound, `1` outbound
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Direction::Inbound),
            "1" => Some(Direction::Outbound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    /// Sentinel counterparty used when a movement names no resolvable partner
    pub fn sentinel(&self) -> &'static str {
        match self {
            Direction::Inbound => UNIDENTIFIED_SUPPLIER,
            Direction::Outbound => FINAL_CONSUMER,
        }
    }
}

/// Quota-bounded family of movement records; each maps to one destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Goods,
    Utility,
    Service,
    Freight,
    Telecom,
}

impl Family {
    pub const ALL: [Family; 5] = [
        Family::Goods,
        Family::Utility,
        Family::Service,
        Family::Freight,
        Family::Telecom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Goods => "goods",
            Family::Utility => "utility",
            Family::Service => "service",
            Family::Freight => "freight",
            Family::Telecom => "telecom",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Family::Goods => "goods_movements",
            Family::Utility => "utility_invoices",
            Family::Service => "service_invoices",
            Family::Freight => "freight_documents",
            Family::Telecom => "telecom_documents",
        }
    }
}

/// Destination store of a buffered row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    Counterparties,
    Ledger(Family),
}

impl Destination {
    pub fn table(&self) -> &'static str {
        match self {
            Destination::Counterparties => "counterparties",
            Destination::Ledger(family) => family.table(),
        }
    }
}

impl From<Family> for Destination {
    fn from(family: Family) -> Self {
        Destination::Ledger(family)
    }
}

/// A movement record ready to be written (or parked in a pending slot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub family: Family,
    pub period: NaiveDate,
    pub entity_document: String,
    pub branch_id: Option<Uuid>,
    pub direction: Direction,
    pub counterparty_code: String,
    pub document_model: String,
    pub series: String,
    pub document_number: String,
    pub access_key: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub amount: BigDecimal,
    pub icms: BigDecimal,
    pub pis: BigDecimal,
    pub cofins: BigDecimal,
}

impl LedgerRecord {
    /// Natural key digest; unique per company in every ledger table
    pub fn dedup_key(&self) -> String {
        let branch = self.branch_id.map(|id| id.to_string()).unwrap_or_default();
        let period = self.period.to_string();
        natural_key([
            self.family.as_str(),
            period.as_str(),
            branch.as_str(),
            self.direction.as_str(),
            self.counterparty_code.as_str(),
            self.document_model.as_str(),
            self.series.as_str(),
            self.document_number.as_str(),
            self.access_key.as_deref().unwrap_or_default(),
        ])
    }
}

/// A business partner declared in the counterparty registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartyRow {
    pub code: String,
    pub name: String,
    pub document: Option<String>,
    pub state_registration: Option<String>,
    pub city_code: Option<String>,
}

impl CounterpartyRow {
    /// The two fixed counterparties every movement may fall back to
    pub fn sentinels() -> [CounterpartyRow; 2] {
        [
            CounterpartyRow::placeholder(UNIDENTIFIED_SUPPLIER, "Fornecedor não identificado"),
            CounterpartyRow::placeholder(FINAL_CONSUMER, "Consumidor final"),
        ]
    }

    fn placeholder(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            document: None,
            state_registration: None,
            city_code: None,
        }
    }
}

/// Anything a decoder can hand to the persister
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Counterparty(CounterpartyRow),
    Ledger(LedgerRecord),
}
