//! Invoice money math and status inference.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::{InvoiceRecord, LineItem};
use crate::legal::normalize::collapse_whitespace;

const MAX_LINE_ITEMS: usize = 200;

/// Largest amount a money column holds (`NUMERIC(14, 2)`).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, 2);

const OUT_OF_RANGE: &str = "amount out of range";

fn in_range(value: Option<Decimal>) -> Result<Decimal, String> {
    match value {
        Some(value) if value.abs() <= MAX_AMOUNT => Ok(money(value)),
        _ => Err(OUT_OF_RANGE.to_string()),
    }
}

/// Status shown to users. Never stored; always inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvoiceStatus {
    Draft,
    Paid,
    Overdue,
    Partial,
    DueSoon,
    PaymentDue,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 6] = [
        Self::Draft,
        Self::Paid,
        Self::Overdue,
        Self::Partial,
        Self::DueSoon,
        Self::PaymentDue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Partial => "partial",
            Self::DueSoon => "dueSoon",
            Self::PaymentDue => "paymentDue",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

pub fn money(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// First matching rule wins: draft, paid, overdue, partial, due soon,
/// otherwise payment due.
pub fn infer_status(invoice: &InvoiceRecord, today: NaiveDate, due_soon_days: i64) -> InvoiceStatus {
    if invoice.is_draft {
        return InvoiceStatus::Draft;
    }
    if invoice.balance() <= Decimal::ZERO {
        return InvoiceStatus::Paid;
    }
    if today > invoice.due_date {
        return InvoiceStatus::Overdue;
    }
    if invoice.total > Decimal::ZERO {
        let ratio = invoice.amount_paid / invoice.total;
        if ratio > Decimal::ZERO && ratio < Decimal::ONE {
            return InvoiceStatus::Partial;
        }
    }
    if (invoice.due_date - today).num_days() <= due_soon_days {
        return InvoiceStatus::DueSoon;
    }
    InvoiceStatus::PaymentDue
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

pub fn build_line_items(inputs: &[LineItemInput]) -> Result<Vec<LineItem>, String> {
    if inputs.len() > MAX_LINE_ITEMS {
        return Err(format!("an invoice may hold at most {MAX_LINE_ITEMS} line items"));
    }
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let description = collapse_whitespace(&input.description);
            if description.is_empty() {
                return Err(format!("line item {} needs a description", index + 1));
            }
            if input.quantity <= Decimal::ZERO {
                return Err(format!("line item {} quantity must be greater than 0", index + 1));
            }
            if input.unit_price < Decimal::ZERO {
                return Err(format!("line item {} unit price must not be negative", index + 1));
            }
            let amount = in_range(input.quantity.checked_mul(input.unit_price))
                .map_err(|e| format!("line item {}: {e}", index + 1))?;
            Ok(LineItem {
                description,
                quantity: input.quantity,
                unit_price: in_range(Some(input.unit_price))
                    .map_err(|e| format!("line item {}: {e}", index + 1))?,
                amount,
            })
        })
        .collect()
}

/// `tax = round2(subtotal * rate / 100)`, `total = max(0, subtotal + tax - discount)`.
pub fn compute_totals(
    items: &[LineItem],
    tax_rate: Decimal,
    discount: Decimal,
) -> Result<Totals, String> {
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
        return Err("tax_rate must be between 0 and 100".to_string());
    }
    if discount < Decimal::ZERO {
        return Err("discount must not be negative".to_string());
    }
    let discount = in_range(Some(discount))?;
    let subtotal = in_range(
        items
            .iter()
            .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.amount)),
    )?;
    let tax = in_range(
        subtotal
            .checked_mul(tax_rate)
            .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED)),
    )?;
    let total = in_range(
        subtotal
            .checked_add(tax)
            .and_then(|gross| gross.checked_sub(discount)),
    )?
    .max(Decimal::ZERO);
    Ok(Totals { subtotal, tax, total })
}

/// Line items and amounts stay editable until money has been received.
pub fn amounts_editable(invoice: &InvoiceRecord) -> bool {
    invoice.is_draft || invoice.amount_paid <= Decimal::ZERO
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentRejection {
    NotPositive,
    Draft,
    ExceedsBalance { balance: Decimal },
}

impl std::fmt::Display for PaymentRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPositive => write!(f, "Payment amount must be greater than 0"),
            Self::Draft => write!(f, "Issue the invoice before recording payments"),
            Self::ExceedsBalance { balance } => {
                write!(f, "Payment exceeds the outstanding balance of {balance}")
            }
        }
    }
}

pub fn validate_payment(invoice: &InvoiceRecord, amount: Decimal) -> Result<Decimal, PaymentRejection> {
    let amount = money(amount);
    if amount <= Decimal::ZERO {
        return Err(PaymentRejection::NotPositive);
    }
    if invoice.is_draft {
        return Err(PaymentRejection::Draft);
    }
    let balance = invoice.balance();
    if amount > balance {
        return Err(PaymentRejection::ExceedsBalance { balance });
    }
    Ok(amount)
}

/// Money roll-up across a set of invoices. Drafts are counted but not billed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvoiceSummary {
    #[serde(with = "rust_decimal::serde::str")]
    pub billed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub paid: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub outstanding: Decimal,
    pub counts: BTreeMap<InvoiceStatus, i64>,
}

pub fn summarize<'a>(
    invoices: impl IntoIterator<Item = &'a InvoiceRecord>,
    today: NaiveDate,
    due_soon_days: i64,
) -> InvoiceSummary {
    let mut summary = InvoiceSummary {
        counts: InvoiceStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
        ..InvoiceSummary::default()
    };
    for invoice in invoices {
        let status = infer_status(invoice, today, due_soon_days);
        *summary.counts.entry(status).or_insert(0) += 1;
        if invoice.is_draft {
            continue;
        }
        summary.billed += invoice.total;
        summary.paid += invoice.amount_paid;
        summary.outstanding += invoice.balance().max(Decimal::ZERO);
    }
    summary.billed = money(summary.billed);
    summary.paid = money(summary.paid);
    summary.outstanding = money(summary.outstanding);
    summary
}
