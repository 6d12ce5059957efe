//! OFX statement parser.
//!
//! Accepts both SGML (OFX 1.x) and XML (OFX 2.x) statements and produces the
//! bank header plus normalized transactions. Malformed `STMTTRN` blocks are
//! skipped and reported instead of failing the whole file.

#![allow(clippy::should_implement_trait)]

mod sgml;

use crate::models::{BankInfo, TransactionType};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfxError {
    #[error("No transactions found in OFX file")]
    NoTransactions,

    #[error("All {0} transactions in OFX file are malformed")]
    AllTransactionsRejected(usize),
}

// ============================================================================
// Transaction Types
// ============================================================================

/// `TRNTYPE` codes defined by the OFX banking specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfxTransactionKind {
    Credit,
    Debit,
    Int,
    Div,
    Fee,
    SrvChg,
    Dep,
    Atm,
    Pos,
    Xfer,
    Check,
    Payment,
    Cash,
    DirectDep,
    DirectDebit,
    RepeatPmt,
    Hold,
    Other,
    Unknown(String),
}

impl OfxTransactionKind {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "CREDIT" => Self::Credit,
            "DEBIT" => Self::Debit,
            "INT" => Self::Int,
            "DIV" => Self::Div,
            "FEE" => Self::Fee,
            "SRVCHG" => Self::SrvChg,
            "DEP" => Self::Dep,
            "ATM" => Self::Atm,
            "POS" => Self::Pos,
            "XFER" => Self::Xfer,
            "CHECK" => Self::Check,
            "PAYMENT" => Self::Payment,
            "CASH" => Self::Cash,
            "DIRECTDEP" => Self::DirectDep,
            "DIRECTDEBIT" => Self::DirectDebit,
            "REPEATPMT" => Self::RepeatPmt,
            "HOLD" => Self::Hold,
            "OTHER" => Self::Other,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Direction implied by the code alone. `None` when the code does not
    /// imply one (transfers, ATM, holds, unknown codes).
    pub fn natural_direction(&self) -> Option<TransactionType> {
        match self {
            Self::Credit | Self::Int | Self::Div | Self::Dep | Self::DirectDep => {
                Some(TransactionType::Credit)
            }
            Self::Debit
            | Self::Fee
            | Self::SrvChg
            | Self::Pos
            | Self::Check
            | Self::Payment
            | Self::Cash
            | Self::DirectDebit
            | Self::RepeatPmt => Some(TransactionType::Debit),
            Self::Atm | Self::Xfer | Self::Hold | Self::Other | Self::Unknown(_) => None,
        }
    }

    /// The amount sign wins; a zero amount falls back to the code.
    pub fn direction(&self, signed_amount: Decimal) -> TransactionType {
        if signed_amount < Decimal::ZERO {
            TransactionType::Debit
        } else if signed_amount > Decimal::ZERO {
            TransactionType::Credit
        } else {
            self.natural_direction().unwrap_or(TransactionType::Credit)
        }
    }
}

// ============================================================================
// Parsed Output
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransaction {
    pub fit_id: Option<String>,
    pub kind: OfxTransactionKind,
    pub transaction_date: NaiveDate,
    /// Absolute value; the sign is carried by `transaction_type`.
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub description: String,
    pub check_number: Option<String>,
    pub document_number: Option<String>,
}

/// A `STMTTRN` block that was dropped, with its position in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTransaction {
    pub index: usize,
    pub fit_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    pub bank_info: BankInfo,
    pub transactions: Vec<ParsedTransaction>,
    pub skipped: Vec<SkippedTransaction>,
}

impl ParsedStatement {
    pub fn total_credits(&self) -> Decimal {
        self.sum_of(TransactionType::Credit)
    }

    pub fn total_debits(&self) -> Decimal {
        self.sum_of(TransactionType::Debit)
    }

    fn sum_of(&self, kind: TransactionType) -> Decimal {
        self.transactions
            .iter()
            .filter(|t| t.transaction_type == kind)
            .map(|t| t.amount)
            .sum()
    }
}

// ============================================================================
// Parsing
// ============================================================================

const TRANSACTION_STOP_TAGS: &[&str] = &["</BANKTRANLIST>", "<LEDGERBAL>", "<AVAILBAL>"];

pub fn parse_ofx(content: &str) -> Result<ParsedStatement, OfxError> {
    let body = sgml::body(content);
    let bank_info = parse_bank_info(body);

    let blocks = sgml::blocks(body, "STMTTRN", TRANSACTION_STOP_TAGS);
    if blocks.is_empty() {
        return Err(OfxError::NoTransactions);
    }

    let mut transactions = Vec::with_capacity(blocks.len());
    let mut skipped = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        match parse_transaction(block) {
            Ok(tx) => transactions.push(tx),
            Err(reason) => {
                tracing::warn!(index, reason = %reason, "Skipping malformed OFX transaction");
                skipped.push(SkippedTransaction {
                    index,
                    fit_id: sgml::value(block, "FITID"),
                    reason,
                });
            }
        }
    }

    if transactions.is_empty() {
        return Err(OfxError::AllTransactionsRejected(skipped.len()));
    }

    Ok(ParsedStatement {
        bank_info,
        transactions,
        skipped,
    })
}

fn parse_bank_info(body: &str) -> BankInfo {
    let account = sgml::block(body, "BANKACCTFROM").or_else(|| sgml::block(body, "CCACCTFROM"));
    let bank_name = sgml::block(body, "FI").and_then(|fi| sgml::value(fi, "ORG"));
    let tran_list = sgml::block(body, "BANKTRANLIST");

    BankInfo {
        bank_code: account.and_then(|a| sgml::value(a, "BANKID")),
        bank_name,
        account_number: account.and_then(|a| sgml::value(a, "ACCTID")),
        agency: account.and_then(|a| sgml::value(a, "BRANCHID")),
        period_start: tran_list
            .and_then(|l| sgml::value(l, "DTSTART"))
            .and_then(|d| parse_date(&d)),
        period_end: tran_list
            .and_then(|l| sgml::value(l, "DTEND"))
            .and_then(|d| parse_date(&d)),
    }
}

fn parse_transaction(block: &str) -> Result<ParsedTransaction, String> {
    let raw_date = sgml::value(block, "DTPOSTED").ok_or("missing DTPOSTED")?;
    let transaction_date =
        parse_date(&raw_date).ok_or_else(|| format!("invalid DTPOSTED '{}'", raw_date))?;

    let raw_amount = sgml::value(block, "TRNAMT").ok_or("missing TRNAMT")?;
    let signed_amount =
        parse_amount(&raw_amount).ok_or_else(|| format!("invalid TRNAMT '{}'", raw_amount))?;

    let kind = sgml::value(block, "TRNTYPE")
        .map(|code| OfxTransactionKind::from_code(&code))
        .unwrap_or(OfxTransactionKind::Other);

    Ok(ParsedTransaction {
        fit_id: sgml::value(block, "FITID"),
        transaction_type: kind.direction(signed_amount),
        kind,
        transaction_date,
        amount: signed_amount.abs(),
        description: describe(sgml::value(block, "NAME"), sgml::value(block, "MEMO")),
        check_number: sgml::value(block, "CHECKNUM").and_then(|c| digits_only(&c)),
        document_number: sgml::value(block, "REFNUM"),
    })
}

/// `YYYYMMDD[HHMMSS[.XXX]][[+-]HH[:MM][:TZ]]`; only the calendar date is kept.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let date = raw.get(..8)?;
    if !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}

/// Whichever of `,` and `.` appears last is the decimal point; the other one
/// groups thousands and is dropped. A decimal point that appears twice makes
/// the amount unreadable.
fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = match cleaned.rfind(|c| c == ',' || c == '.') {
        Some(at) => {
            let decimal = cleaned.as_bytes()[at] as char;
            let grouping = if decimal == ',' { '.' } else { ',' };
            let (whole, fraction) = cleaned.split_at(at);
            if whole.contains(decimal) {
                return None;
            }
            format!("{}.{}", whole.replace(grouping, ""), &fraction[1..])
        }
        None => cleaned,
    };
    let normalized = normalized.strip_prefix('+').unwrap_or(&normalized);
    Decimal::from_str(normalized).ok()
}

fn describe(name: Option<String>, memo: Option<String>) -> String {
    match (name, memo) {
        (Some(name), Some(memo)) if name != memo => format!("{} - {}", name, memo),
        (Some(name), _) => name,
        (None, Some(memo)) => memo,
        (None, None) => String::new(),
    }
}

fn digits_only(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Decodes raw upload bytes. Valid UTF-8 is used as is (BOM removed);
/// anything else is read as Windows-1252, the superset of Latin-1 that
/// Brazilian banks emit.
pub fn decode_ofx_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SGML_STATEMENT: &str = "OFXHEADER:100
DATA:OFXSGML
VERSION:102
ENCODING:USASCII
CHARSET:1252

<OFX>
<SIGNONMSGSRSV1><SONRS>
<STATUS><CODE>0<SEVERITY>INFO</STATUS>
<DTSERVER>20240131120000[-3:BRT]
<LANGUAGE>POR
<FI><ORG>Banco do Brasil<FID>001</FI>
</SONRS></SIGNONMSGSRSV1>
<BANKMSGSRSV1><STMTTRNRS><TRNUID>1
<STMTRS><CURDEF>BRL
<BANKACCTFROM><BANKID>001<BRANCHID>1234-5<ACCTID>98765-4<ACCTTYPE>CHECKING</BANKACCTFROM>
<BANKTRANLIST><DTSTART>20240101<DTEND>20240131
<STMTTRN><TRNTYPE>CHECK<DTPOSTED>20240105100000[-3:BRT]<TRNAMT>-150,00<FITID>A1<CHECKNUM>001001<NAME>CHEQUE COMPENSADO
<STMTTRN><TRNTYPE>DEP<DTPOSTED>20240110<TRNAMT>500.00<FITID>A2<MEMO>DEPOSITO
<STMTTRN><TRNTYPE>FEE<DTPOSTED>20240115<TRNAMT>-12.50<FITID>A3<NAME>TARIFA<MEMO>Pacote &amp; servicos<REFNUM>778
</BANKTRANLIST>
<LEDGERBAL><BALAMT>337.50<DTASOF>20240131
</STMTRS></STMTTRNRS></BANKMSGSRSV1>
</OFX>";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_sgml_statement() {
        let parsed = parse_ofx(SGML_STATEMENT).unwrap();

        assert_eq!(parsed.bank_info.bank_code.as_deref(), Some("001"));
        assert_eq!(parsed.bank_info.bank_name.as_deref(), Some("Banco do Brasil"));
        assert_eq!(parsed.bank_info.agency.as_deref(), Some("1234-5"));
        assert_eq!(parsed.bank_info.account_number.as_deref(), Some("98765-4"));
        assert_eq!(parsed.bank_info.period_start, Some(date(2024, 1, 1)));
        assert_eq!(parsed.bank_info.period_end, Some(date(2024, 1, 31)));

        assert_eq!(parsed.transactions.len(), 3);
        assert!(parsed.skipped.is_empty());

        let check = &parsed.transactions[0];
        assert_eq!(check.kind, OfxTransactionKind::Check);
        assert_eq!(check.transaction_type, TransactionType::Debit);
        assert_eq!(check.amount, Decimal::new(15000, 2));
        assert_eq!(check.transaction_date, date(2024, 1, 5));
        assert_eq!(check.check_number.as_deref(), Some("001001"));
        assert_eq!(check.description, "CHEQUE COMPENSADO");

        let deposit = &parsed.transactions[1];
        assert_eq!(deposit.transaction_type, TransactionType::Credit);
        assert_eq!(deposit.description, "DEPOSITO");
        assert_eq!(deposit.check_number, None);

        let fee = &parsed.transactions[2];
        assert_eq!(fee.description, "TARIFA - Pacote & servicos");
        assert_eq!(fee.document_number.as_deref(), Some("778"));

        assert_eq!(parsed.total_credits(), Decimal::new(50000, 2));
        assert_eq!(parsed.total_debits(), Decimal::new(16250, 2));
    }

    #[test]
    fn parses_xml_statement() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<?OFX OFXHEADER="200" VERSION="220"?>
<ofx>
  <bankmsgsrsv1><stmttrnrs><stmtrs>
    <bankacctfrom><bankid>341</bankid><acctid>555</acctid></bankacctfrom>
    <banktranlist>
      <dtstart>20240201</dtstart><dtend>20240229</dtend>
      <stmttrn>
        <trntype>DEBIT</trntype>
        <dtposted>20240203</dtposted>
        <trnamt>-42.10</trnamt>
        <fitid>X1</fitid>
        <checknum>77</checknum>
        <name>Same</name>
        <memo>Same</memo>
      </stmttrn>
    </banktranlist>
  </stmtrs></stmttrnrs></bankmsgsrsv1>
</ofx>"#;

        let parsed = parse_ofx(xml).unwrap();
        assert_eq!(parsed.bank_info.bank_code.as_deref(), Some("341"));
        assert_eq!(parsed.bank_info.bank_name, None);
        assert_eq!(parsed.transactions.len(), 1);

        let tx = &parsed.transactions[0];
        assert_eq!(tx.fit_id.as_deref(), Some("X1"));
        assert_eq!(tx.check_number.as_deref(), Some("77"));
        assert_eq!(tx.description, "Same");
        assert_eq!(tx.amount, Decimal::new(4210, 2));
    }

    #[test]
    fn skips_malformed_blocks_and_keeps_the_rest() {
        let sgml = "<OFX><BANKTRANLIST>
<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>2024XX01<TRNAMT>-1.00<FITID>BAD
<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>20240102<TRNAMT>-2.00<FITID>OK
<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>20240103<FITID>NOAMT
</BANKTRANLIST></OFX>";

        let parsed = parse_ofx(sgml).unwrap();
        assert_eq!(parsed.transactions.len(), 1);
        assert_eq!(parsed.skipped.len(), 2);
        assert_eq!(parsed.skipped[0].index, 0);
        assert_eq!(parsed.skipped[0].fit_id.as_deref(), Some("BAD"));
        assert_eq!(parsed.skipped[1].index, 2);
        assert!(parsed.skipped[1].reason.contains("TRNAMT"));
    }

    #[test]
    fn rejects_files_without_usable_transactions() {
        assert_eq!(
            parse_ofx("<OFX><BANKTRANLIST></BANKTRANLIST></OFX>"),
            Err(OfxError::NoTransactions)
        );
        assert_eq!(parse_ofx("not an ofx file"), Err(OfxError::NoTransactions));
        assert_eq!(
            parse_ofx("<OFX><STMTTRN><TRNAMT>abc</STMTTRN></OFX>"),
            Err(OfxError::AllTransactionsRejected(1))
        );
    }

    #[test]
    fn amount_sign_overrides_type_code() {
        let kind = OfxTransactionKind::from_code("debit");
        assert_eq!(kind, OfxTransactionKind::Debit);
        assert_eq!(kind.direction(Decimal::new(5, 0)), TransactionType::Credit);
        assert_eq!(kind.direction(Decimal::ZERO), TransactionType::Debit);

        let unknown = OfxTransactionKind::from_code("PIX");
        assert_eq!(unknown, OfxTransactionKind::Unknown("PIX".into()));
        assert_eq!(unknown.direction(Decimal::ZERO), TransactionType::Credit);
        assert_eq!(
            OfxTransactionKind::Xfer.direction(Decimal::new(-1, 0)),
            TransactionType::Debit
        );
    }

    #[test]
    fn dates_ignore_time_and_timezone() {
        assert_eq!(parse_date("20240229"), Some(date(2024, 2, 29)));
        assert_eq!(parse_date("20240229235959.999[-3:BRT]"), Some(date(2024, 2, 29)));
        assert_eq!(parse_date("20240230"), None);
        assert_eq!(parse_date("2024"), None);
    }

    #[test]
    fn amounts_accept_both_decimal_separators() {
        assert_eq!(parse_amount("-150,25"), Some(Decimal::new(-15025, 2)));
        assert_eq!(parse_amount("+1,234.50"), Some(Decimal::new(123450, 2)));
        assert_eq!(parse_amount("10"), Some(Decimal::new(10, 0)));
        assert_eq!(parse_amount("ten"), None);
    }

    #[test]
    fn last_separator_is_the_decimal_point() {
        assert_eq!(parse_amount("-1.234,56"), Some(Decimal::new(-123456, 2)));
        assert_eq!(parse_amount("1.234.567,89"), Some(Decimal::new(123456789, 2)));
        assert_eq!(parse_amount("-1,234,567.89"), Some(Decimal::new(-123456789, 2)));
        assert_eq!(parse_amount("1,234,567"), None);
        assert_eq!(parse_amount("1.234.567"), None);
    }

    #[test]
    fn check_numbers_keep_only_digits() {
        assert_eq!(digits_only("00-1234 "), Some("001234".to_string()));
        assert_eq!(digits_only("N/A"), None);
    }

    #[test]
    fn decodes_latin1_and_strips_bom() {
        assert_eq!(decode_ofx_bytes(b"\xEF\xBB\xBF<OFX>"), "<OFX>");
        assert_eq!(decode_ofx_bytes(b"CAF\xC9 S\xC3O JO\xC3O"), "CAFÉ SÃO JOÃO");
        assert_eq!(decode_ofx_bytes("AÇÃO".as_bytes()), "AÇÃO");
    }
}
