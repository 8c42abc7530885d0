//! Per-kind field decoders
//!
//! Every decoder is a pure function of the split fields and the processing
//! context. Decoders may update the context (period, variant, registries,
//! active branch when it is already known) but never perform I/O: anything
//! that needs durable storage is returned as a [`BranchDirective`] for the
//! stream driver to carry out.

use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use efd_common::text::{
    digits_only, first_of_month, is_cnpj, is_date, normalize_cnpj, parse_amount, parse_date,
    parse_optional_date,
};

use super::classifier::RecordKind;
use super::context::{FormatVariant, ProcessingContext};
use super::models::{CounterpartyRow, Direction, Family, LedgerRecord, Row};
use crate::error::DecodeError;

/// `COD_SIT` values of documents that never produced a movement
/// (cancelled, denied, unused numbering)
const VOID_STATUSES: [&str; 4] = ["02", "03", "04", "05"];

// Widths of the fixed-size destination columns
const DOCUMENT_WIDTH: usize = 14;
const STATE_WIDTH: usize = 2;
const CITY_CODE_WIDTH: usize = 7;
const MODEL_WIDTH: usize = 4;
const ACCESS_KEY_WIDTH: usize = 44;

/// Amounts are stored as `NUMERIC(18, 2)`
const MAX_AMOUNT_DIGITS: u32 = 16;

/// What the stream driver should do with a decoded line
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Nothing to write
    Skip,
    /// The context changed but nothing is written
    Updated,
    /// A row ready for the persister
    Emit(Row),
    /// A primary record whose sub-totals follow in auxiliary lines
    Open(LedgerRecord),
    /// Sub-totals for the open slot of a family
    Accumulate {
        family: Family,
        pis: BigDecimal,
        cofins: BigDecimal,
    },
    /// A branch must be resolved against durable storage
    Branch(BranchDirective),
}

/// Descriptive fields of an establishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub document: String,
    pub external_code: Option<String>,
    pub name: Option<String>,
    pub state: Option<String>,
    pub city_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchDirective {
    /// Registry record: ensure the branch, refresh its fields, activate it
    Register(BranchSpec),
    /// Context switch to a branch nobody registered in this slice
    Fallback(BranchSpec),
}

impl BranchDirective {
    pub fn spec(&self) -> &BranchSpec {
        match self {
            BranchDirective::Register(spec) | BranchDirective::Fallback(spec) => spec,
        }
    }
}

/// Decode one classified line
pub fn decode(
    kind: RecordKind,
    fields: &[&str],
    ctx: &mut ProcessingContext,
) -> Result<Decoded, DecodeError> {
    let f = Fields { kind, raw: fields };
    match kind {
        RecordKind::Header => decode_header(&f, ctx),
        RecordKind::Establishment => decode_establishment(&f, ctx),
        RecordKind::Partner => decode_partner(&f, ctx),
        RecordKind::EntitySwitch => decode_entity_switch(&f, ctx),
        RecordKind::GoodsDocument => decode_goods(&f, ctx),
        RecordKind::UtilityInvoice => decode_utility(&f, ctx),
        RecordKind::ServiceInvoice => decode_service(&f, ctx),
        RecordKind::FreightDocument => decode_freight(&f, ctx),
        RecordKind::TelecomDocument => decode_telecom(&f, ctx),
        RecordKind::FreightPis => subtotal(&f, Family::Freight, 8, Tax::Pis),
        RecordKind::FreightCofins => subtotal(&f, Family::Freight, 8, Tax::Cofins),
        RecordKind::TelecomPis => subtotal(&f, Family::Telecom, 7, Tax::Pis),
        RecordKind::TelecomCofins => subtotal(&f, Family::Telecom, 7, Tax::Cofins),
    }
}

struct Fields<'l, 'a> {
    kind: RecordKind,
    raw: &'l [&'a str],
}

impl<'l, 'a> Fields<'l, 'a> {
    fn len(&self) -> usize {
        self.raw.len()
    }

    fn text(&self, index: usize) -> &'a str {
        self.raw.get(index).map(|field| field.trim()).unwrap_or("")
    }

    fn opt_text(&self, index: usize) -> Option<String> {
        let value = self.text(index);
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Text of a field stored in a column of at most `width` characters
    fn bounded(&self, index: usize, width: usize) -> Result<&'a str, DecodeError> {
        let value = self.text(index);
        self.fits(&format!("field {}", index), value, width)?;
        Ok(value)
    }

    fn opt_bounded(&self, index: usize, width: usize) -> Result<Option<String>, DecodeError> {
        let value = self.bounded(index, width)?;
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    fn fits(&self, what: &str, value: &str, width: usize) -> Result<(), DecodeError> {
        if value.chars().count() > width {
            return Err(self.malformed(format!(
                "{} {:?} is longer than {} characters",
                what, value, width
            )));
        }
        Ok(())
    }

    fn amount(&self, index: usize) -> Result<BigDecimal, DecodeError> {
        let value = parse_amount(self.text(index))
            .map_err(|e| self.malformed(format!("field {}: {}", index, e)))?;
        if value.abs() >= BigDecimal::from(10_u64.pow(MAX_AMOUNT_DIGITS)) {
            return Err(self.malformed(format!(
                "field {}: {} has more than {} integer digits",
                index, value, MAX_AMOUNT_DIGITS
            )));
        }
        Ok(value)
    }

    fn direction(&self, index: usize) -> Result<Direction, DecodeError> {
        Direction::from_code(self.text(index))
            .ok_or_else(|| self.malformed(format!("invalid direction {:?}", self.text(index))))
    }

    fn is_void(&self, index: usize) -> bool {
        VOID_STATUSES.contains(&self.text(index))
    }

    fn require(&self, count: usize) -> Result<(), DecodeError> {
        if self.len() < count {
            return Err(self.malformed(format!("{} fields, expected {}", self.len(), count)));
        }
        Ok(())
    }

    fn period(&self, ctx: &ProcessingContext) -> Result<NaiveDate, DecodeError> {
        ctx.period.ok_or(DecodeError::MissingPeriod { kind: self.kind })
    }

    fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Malformed {
            kind: self.kind,
            reason: reason.into(),
        }
    }
}

fn looks_like_document(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '/' | '-'))
        && is_cnpj(&digits_only(value))
}

fn decode_header(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let variant = if is_date(f.text(6)) {
        FormatVariant::Contributions
    } else {
        FormatVariant::IcmsIpi
    };
    let (period_at, entity_at) = match variant {
        FormatVariant::Contributions => (6, 9),
        FormatVariant::IcmsIpi => (4, 7),
    };

    let start_at = if is_date(f.text(period_at)) {
        period_at
    } else {
        (3..f.len())
            .find(|&i| is_date(f.text(i)))
            .ok_or_else(|| f.malformed("no DDMMYYYY period field"))?
    };
    let start = parse_date(f.text(start_at)).map_err(|e| f.malformed(e.to_string()))?;
    let last_date_at = (start_at..f.len())
        .take_while(|&i| is_date(f.text(i)))
        .last()
        .unwrap_or(start_at);

    let at_layout = digits_only(f.text(entity_at));
    let entity = if is_cnpj(&at_layout) {
        Some(at_layout)
    } else {
        (last_date_at + 1..f.len())
            .map(|i| f.text(i))
            .find(|value| looks_like_document(value))
            .map(digits_only)
    };
    let name = (last_date_at + 1..f.len())
        .map(|i| f.text(i))
        .find(|value| value.chars().any(char::is_alphabetic))
        .map(str::to_string);

    let branch = ctx.default_branch.or_else(|| {
        entity
            .as_ref()
            .and_then(|document| ctx.branches.get(document).copied())
    });

    ctx.period = Some(first_of_month(start));
    ctx.variant = Some(variant);
    ctx.branch_id = branch;
    ctx.entity_document = entity;
    ctx.entity_name = name;

    Ok(Decoded::Updated)
}

fn decode_establishment(
    f: &Fields<'_, '_>,
    ctx: &mut ProcessingContext,
) -> Result<Decoded, DecodeError> {
    let document = normalize_cnpj(f.text(4)).map_err(|e| f.malformed(e.to_string()))?;
    let external_code = f.opt_text(2);
    if let Some(code) = &external_code {
        ctx.establishments.insert(document.clone(), code.clone());
    }

    Ok(Decoded::Branch(BranchDirective::Register(BranchSpec {
        document,
        external_code,
        name: f.opt_text(3),
        state: f.opt_bounded(5, STATE_WIDTH)?,
        city_code: f.opt_bounded(7, CITY_CODE_WIDTH)?,
    })))
}

fn decode_partner(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let code = f.text(2);
    if code.is_empty() {
        return Err(f.malformed("empty partner code"));
    }
    let name = f.text(3).to_string();
    let document = [5, 6]
        .iter()
        .map(|&i| digits_only(f.text(i)))
        .find(|digits| !digits.is_empty());
    if let Some(digits) = &document {
        f.fits("document", digits, DOCUMENT_WIDTH)?;
    }
    let city_code = f.opt_bounded(8, CITY_CODE_WIDTH)?;

    ctx.declare_partner(code);

    Ok(Decoded::Emit(Row::Counterparty(CounterpartyRow {
        code: code.to_string(),
        name,
        document,
        state_registration: f.opt_text(7),
        city_code,
    })))
}

fn decode_entity_switch(
    f: &Fields<'_, '_>,
    ctx: &mut ProcessingContext,
) -> Result<Decoded, DecodeError> {
    let document = normalize_cnpj(f.text(2)).map_err(|e| f.malformed(e.to_string()))?;

    if let Some(id) = ctx.branches.get(&document).copied() {
        ctx.branch_id = Some(id);
        return Ok(Decoded::Updated);
    }

    let external_code = ctx.establishments.get(&document).cloned();
    Ok(Decoded::Branch(BranchDirective::Fallback(BranchSpec {
        document,
        external_code,
        name: None,
        state: None,
        city_code: None,
    })))
}

/// Document fields shared by every movement family
struct Document<'a> {
    direction: Direction,
    counterparty: &'a str,
    model: &'a str,
    series: &'a str,
    number: &'a str,
    access_key: Option<String>,
    issue_date: Option<NaiveDate>,
    amount: BigDecimal,
    icms: BigDecimal,
    pis: BigDecimal,
    cofins: BigDecimal,
}

fn ledger_record(
    ctx: &ProcessingContext,
    period: NaiveDate,
    family: Family,
    doc: Document<'_>,
) -> LedgerRecord {
    let counterparty_code = if ctx.resolvable_partner(doc.counterparty) {
        doc.counterparty.to_string()
    } else {
        doc.direction.sentinel().to_string()
    };

    LedgerRecord {
        family,
        period,
        entity_document: ctx.entity_document.clone().unwrap_or_default(),
        branch_id: ctx.branch_id,
        direction: doc.direction,
        counterparty_code,
        document_model: doc.model.to_string(),
        series: doc.series.to_string(),
        document_number: doc.number.to_string(),
        access_key: doc.access_key,
        issue_date: doc.issue_date,
        amount: doc.amount,
        icms: doc.icms,
        pis: doc.pis,
        cofins: doc.cofins,
    }
}

fn emit(ctx: &ProcessingContext, period: NaiveDate, family: Family, doc: Document<'_>) -> Decoded {
    if doc.amount <= BigDecimal::zero() {
        return Decoded::Skip;
    }
    Decoded::Emit(Row::Ledger(ledger_record(ctx, period, family, doc)))
}

fn open(ctx: &ProcessingContext, period: NaiveDate, family: Family, doc: Document<'_>) -> Decoded {
    if doc.amount <= BigDecimal::zero() {
        return Decoded::Skip;
    }
    Decoded::Open(ledger_record(ctx, period, family, doc))
}

fn aggregates_subtotals(ctx: &ProcessingContext) -> bool {
    ctx.variant == Some(FormatVariant::Contributions)
}

fn decode_goods(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let period = f.period(ctx)?;
    if f.is_void(6) {
        return Ok(Decoded::Skip);
    }

    let doc = Document {
        direction: f.direction(2)?,
        counterparty: f.text(4),
        model: f.bounded(5, MODEL_WIDTH)?,
        series: f.text(7),
        number: f.text(8),
        access_key: f.opt_bounded(9, ACCESS_KEY_WIDTH)?,
        issue_date: parse_optional_date(f.text(10)),
        amount: f.amount(12)?,
        icms: f.amount(22)?,
        pis: f.amount(26)?,
        cofins: f.amount(27)?,
    };
    Ok(emit(ctx, period, Family::Goods, doc))
}

fn decode_utility(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let period = f.period(ctx)?;

    let doc = if aggregates_subtotals(ctx) {
        // Contributions layout lists only acquisitions
        Document {
            direction: Direction::Inbound,
            counterparty: f.text(2),
            model: f.bounded(3, MODEL_WIDTH)?,
            series: f.text(5),
            number: f.text(7),
            access_key: None,
            issue_date: parse_optional_date(f.text(8)),
            amount: f.amount(10)?,
            icms: f.amount(11)?,
            pis: f.amount(13)?,
            cofins: f.amount(14)?,
        }
    } else {
        f.require(15)?;
        if f.is_void(6) {
            return Ok(Decoded::Skip);
        }
        Document {
            direction: f.direction(2)?,
            counterparty: f.text(4),
            model: f.bounded(5, MODEL_WIDTH)?,
            series: f.text(7),
            number: f.text(10),
            access_key: None,
            issue_date: parse_optional_date(f.text(11)),
            amount: f.amount(13)?,
            icms: f.amount(20)?,
            pis: f.amount(24)?,
            cofins: f.amount(25)?,
        }
    };
    Ok(emit(ctx, period, Family::Utility, doc))
}

fn decode_service(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let period = f.period(ctx)?;
    if f.is_void(5) {
        return Ok(Decoded::Skip);
    }

    let doc = Document {
        direction: f.direction(2)?,
        counterparty: f.text(4),
        model: "",
        series: f.text(6),
        number: f.text(8),
        access_key: f.opt_bounded(9, ACCESS_KEY_WIDTH)?,
        issue_date: parse_optional_date(f.text(10)),
        amount: f.amount(12)?,
        icms: BigDecimal::zero(),
        pis: f.amount(16)?,
        cofins: f.amount(18)?,
    };
    Ok(emit(ctx, period, Family::Service, doc))
}

fn decode_freight(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let period = f.period(ctx)?;
    if f.is_void(6) {
        return Ok(Decoded::Skip);
    }

    let doc = Document {
        direction: f.direction(2)?,
        counterparty: f.text(4),
        model: f.bounded(5, MODEL_WIDTH)?,
        series: f.text(7),
        number: f.text(9),
        access_key: f.opt_bounded(10, ACCESS_KEY_WIDTH)?,
        issue_date: parse_optional_date(f.text(11)),
        amount: f.amount(15)?,
        icms: f.amount(20)?,
        pis: BigDecimal::zero(),
        cofins: BigDecimal::zero(),
    };

    if aggregates_subtotals(ctx) {
        Ok(open(ctx, period, Family::Freight, doc))
    } else {
        Ok(emit(ctx, period, Family::Freight, doc))
    }
}

fn decode_telecom(f: &Fields<'_, '_>, ctx: &mut ProcessingContext) -> Result<Decoded, DecodeError> {
    let period = f.period(ctx)?;
    if f.is_void(6) {
        return Ok(Decoded::Skip);
    }

    let aggregate = aggregates_subtotals(ctx);
    let (pis, cofins) = if aggregate {
        (BigDecimal::zero(), BigDecimal::zero())
    } else {
        (f.amount(21)?, f.amount(22)?)
    };

    let doc = Document {
        direction: f.direction(2)?,
        counterparty: f.text(4),
        model: f.bounded(5, MODEL_WIDTH)?,
        series: f.text(7),
        number: f.text(9),
        access_key: None,
        issue_date: parse_optional_date(f.text(10)),
        amount: f.amount(12)?,
        icms: f.amount(19)?,
        pis,
        cofins,
    };

    if aggregate {
        Ok(open(ctx, period, Family::Telecom, doc))
    } else {
        Ok(emit(ctx, period, Family::Telecom, doc))
    }
}

enum Tax {
    Pis,
    Cofins,
}

fn subtotal(
    f: &Fields<'_, '_>,
    family: Family,
    value_at: usize,
    tax: Tax,
) -> Result<Decoded, DecodeError> {
    let value = f.amount(value_at)?;
    let (pis, cofins) = match tax {
        Tax::Pis => (value, BigDecimal::zero()),
        Tax::Cofins => (BigDecimal::zero(), value),
    };
    Ok(Decoded::Accumulate {
        family,
        pis,
        cofins,
    })
}
