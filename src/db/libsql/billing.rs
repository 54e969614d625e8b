use chrono::Utc;
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    CreateInvoiceParams, CreatePaymentParams, InvoiceFilter, InvoiceRecord, InvoiceStore,
    PaymentRecord, UpdateInvoiceParams, Visibility,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, bool_value, fmt_ts, from_json, get_bool, get_i64, get_opt_text,
    get_text, in_transaction, opt_date, opt_text, opt_text_owned, parse_date, parse_date_opt,
    parse_decimal, parse_ts, parse_uuid, parse_uuid_opt, to_json,
};

const INVOICE_COLUMNS: &str = "i.id, i.invoice_number, i.matter_id, i.client_id, i.issue_date, \
     i.due_date, i.line_items, i.subtotal, i.tax_rate, i.tax, i.discount, i.total, i.amount_paid, \
     i.is_draft, i.notes, i.created_by, i.created_at, i.updated_at";

const PAYMENT_COLUMNS: &str =
    "id, invoice_id, amount, paid_on, method, reference, recorded_by, created_at";

fn row_to_invoice_record(row: &libsql::Row) -> Result<InvoiceRecord, DatabaseError> {
    Ok(InvoiceRecord {
        id: parse_uuid(&get_text(row, 0), "invoice.id")?,
        invoice_number: get_text(row, 1),
        matter_id: parse_uuid(&get_text(row, 2), "invoice.matter_id")?,
        client_id: parse_uuid(&get_text(row, 3), "invoice.client_id")?,
        issue_date: parse_date_opt(get_opt_text(row, 4))?,
        due_date: parse_date(&get_text(row, 5))?,
        line_items: from_json(&get_text(row, 6))?,
        subtotal: parse_decimal(&get_text(row, 7), "subtotal")?,
        tax_rate: parse_decimal(&get_text(row, 8), "tax_rate")?,
        tax: parse_decimal(&get_text(row, 9), "tax")?,
        discount: parse_decimal(&get_text(row, 10), "discount")?,
        total: parse_decimal(&get_text(row, 11), "total")?,
        amount_paid: parse_decimal(&get_text(row, 12), "amount_paid")?,
        is_draft: get_bool(row, 13),
        notes: get_opt_text(row, 14),
        created_by: parse_uuid_opt(get_opt_text(row, 15), "invoice.created_by")?,
        created_at: parse_ts(&get_text(row, 16))?,
        updated_at: parse_ts(&get_text(row, 17))?,
    })
}

fn row_to_payment_record(row: &libsql::Row) -> Result<PaymentRecord, DatabaseError> {
    Ok(PaymentRecord {
        id: parse_uuid(&get_text(row, 0), "payment.id")?,
        invoice_id: parse_uuid(&get_text(row, 1), "payment.invoice_id")?,
        amount: parse_decimal(&get_text(row, 2), "payment.amount")?,
        paid_on: parse_date(&get_text(row, 3))?,
        method: get_opt_text(row, 4),
        reference: get_opt_text(row, 5),
        recorded_by: parse_uuid_opt(get_opt_text(row, 6), "payment.recorded_by")?,
        created_at: parse_ts(&get_text(row, 7))?,
    })
}

fn money(value: Decimal) -> String {
    value.round_dp(2).to_string()
}

async fn fetch_invoice(
    conn: &libsql::Connection,
    id: Uuid,
) -> Result<Option<InvoiceRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {INVOICE_COLUMNS} FROM invoices i WHERE i.id = ?1 LIMIT 1"),
            params![id.to_string()],
        )
        .await?
        .next()
        .await?;
    row.map(|row| row_to_invoice_record(&row)).transpose()
}

#[async_trait::async_trait]
impl InvoiceStore for LibSqlBackend {
    async fn create_invoice(
        &self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO invoices (id, invoice_number, matter_id, client_id, issue_date, due_date, \
             line_items, subtotal, tax_rate, tax, discount, total, amount_paid, is_draft, notes, \
             created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, '0.00', ?13, ?14, ?15, ?16, ?16)",
            params![
                id.to_string(),
                input.invoice_number.as_str(),
                input.matter_id.to_string(),
                input.client_id.to_string(),
                opt_date(input.issue_date),
                input.due_date.to_string(),
                to_json(&input.line_items)?,
                money(input.subtotal),
                input.tax_rate.normalize().to_string(),
                money(input.tax),
                money(input.discount),
                money(input.total),
                bool_value(input.is_draft),
                opt_text(input.notes.as_deref()),
                input.created_by.to_string(),
                now,
            ],
        )
        .await?;

        fetch_invoice(&conn, id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created invoice".to_string()))
    }

    async fn get_invoice(&self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        fetch_invoice(&conn, id).await
    }

    async fn list_invoices(
        &self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        match filter.visibility {
            Visibility::All => {}
            Visibility::Client(user_id) => {
                let p = args.text(user_id.to_string());
                args.clause(format!("i.client_id = {p}"));
            }
            // Members have no invoice access; return nothing rather than leak.
            Visibility::Member(_) => args.clause("0 = 1".to_string()),
        }
        if let Some(matter_id) = filter.matter_id {
            let p = args.text(matter_id.to_string());
            args.clause(format!("i.matter_id = {p}"));
        }
        if let Some(client_id) = filter.client_id {
            let p = args.text(client_id.to_string());
            args.clause(format!("i.client_id = {p}"));
        }
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices i{} ORDER BY i.created_at DESC, i.id ASC",
                    args.where_sql()
                ),
                args.params(),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_invoice_record(&row)?);
        }
        Ok(out)
    }

    async fn update_invoice(
        &self,
        id: Uuid,
        input: &UpdateInvoiceParams,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let Some(existing) = fetch_invoice(&conn, id).await? else {
            return Ok(None);
        };

        let issue_date = input.issue_date.unwrap_or(existing.issue_date);
        let due_date = input.due_date.unwrap_or(existing.due_date);
        let line_items = input.line_items.clone().unwrap_or(existing.line_items);
        let subtotal = input.subtotal.unwrap_or(existing.subtotal);
        let tax_rate = input.tax_rate.unwrap_or(existing.tax_rate);
        let tax = input.tax.unwrap_or(existing.tax);
        let discount = input.discount.unwrap_or(existing.discount);
        let total = input.total.unwrap_or(existing.total);
        let is_draft = input.is_draft.unwrap_or(existing.is_draft);
        let notes = input.notes.clone().unwrap_or(existing.notes);

        conn.execute(
            "UPDATE invoices SET issue_date = ?2, due_date = ?3, line_items = ?4, subtotal = ?5, \
             tax_rate = ?6, tax = ?7, discount = ?8, total = ?9, is_draft = ?10, notes = ?11, \
             updated_at = ?12 WHERE id = ?1",
            params![
                id.to_string(),
                opt_date(issue_date),
                due_date.to_string(),
                to_json(&line_items)?,
                money(subtotal),
                tax_rate.normalize().to_string(),
                money(tax),
                money(discount),
                money(total),
                bool_value(is_draft),
                opt_text_owned(notes),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        fetch_invoice(&conn, id).await
    }

    async fn delete_invoice(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM invoices WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn record_payment(
        &self,
        invoice_id: Uuid,
        input: &CreatePaymentParams,
    ) -> Result<Option<(InvoiceRecord, PaymentRecord)>, DatabaseError> {
        let conn = self.connect().await?;
        in_transaction!(conn, async {
            let Some(invoice) = fetch_invoice(&conn, invoice_id).await? else {
                return Ok(None);
            };
            if invoice.is_draft {
                return Err(DatabaseError::Constraint(
                    "payments cannot be recorded against a draft invoice".to_string(),
                ));
            }
            if input.amount > invoice.balance() {
                return Err(DatabaseError::Constraint(format!(
                    "payment {} exceeds outstanding balance {}",
                    input.amount,
                    invoice.balance()
                )));
            }

            let payment_id = Uuid::new_v4();
            let now = fmt_ts(&Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO invoice_payments ({PAYMENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    payment_id.to_string(),
                    invoice_id.to_string(),
                    money(input.amount),
                    input.paid_on.to_string(),
                    opt_text(input.method.as_deref()),
                    opt_text(input.reference.as_deref()),
                    input.recorded_by.to_string(),
                    now.as_str(),
                ],
            )
            .await?;
            conn.execute(
                "UPDATE invoices SET amount_paid = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    invoice_id.to_string(),
                    money(invoice.amount_paid + input.amount),
                    now.as_str(),
                ],
            )
            .await?;

            let invoice = fetch_invoice(&conn, invoice_id)
                .await?
                .ok_or_else(|| DatabaseError::Query("invoice vanished mid-payment".to_string()))?;
            let row = conn
                .query(
                    &format!("SELECT {PAYMENT_COLUMNS} FROM invoice_payments WHERE id = ?1"),
                    params![payment_id.to_string()],
                )
                .await?
                .next()
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load payment".to_string()))?;
            Ok(Some((invoice, row_to_payment_record(&row)?)))
        })
    }

    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM invoice_payments WHERE invoice_id = ?1 \
                     ORDER BY paid_on ASC, created_at ASC"
                ),
                params![invoice_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_payment_record(&row)?);
        }
        Ok(out)
    }

    async fn invoice_numbers_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT invoice_number FROM invoices WHERE invoice_number LIKE ?1",
                params![format!("{}%", prefix)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(get_text(&row, 0));
        }
        Ok(out)
    }

    async fn count_invoices_for_matter(&self, matter_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT COUNT(*) FROM invoices WHERE matter_id = ?1",
                params![matter_id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.map(|row| get_i64(&row, 0)).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use crate::db::{CreatePaymentParams, Role};
    use crate::error::DatabaseError;
    use crate::testing::{seed_invoice, seed_matter, seed_user, test_db};

    fn payment(amount: rust_decimal::Decimal, recorded_by: uuid::Uuid) -> CreatePaymentParams {
        CreatePaymentParams {
            amount,
            paid_on: Utc::now().date_naive(),
            method: Some("wire".into()),
            reference: None,
            recorded_by,
        }
    }

    #[tokio::test]
    async fn payments_accumulate_up_to_the_total() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(db.as_ref(), admin.id, Some(client.id), vec![]).await;
        let due = Utc::now().date_naive() + Duration::days(10);
        let invoice = seed_invoice(db.as_ref(), &matter, admin.id, dec!(100), due, false).await;

        let (after, first) = db
            .record_payment(invoice.id, &payment(dec!(60), admin.id))
            .await
            .unwrap()
            .expect("invoice exists");
        assert_eq!(after.amount_paid, dec!(60));
        assert_eq!(first.amount, dec!(60));

        let err = db
            .record_payment(invoice.id, &payment(dec!(40.01), admin.id))
            .await
            .expect_err("over balance");
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(
            db.get_invoice(invoice.id).await.unwrap().unwrap().amount_paid,
            dec!(60)
        );

        db.record_payment(invoice.id, &payment(dec!(40), admin.id))
            .await
            .unwrap()
            .expect("invoice exists");
        assert_eq!(db.list_payments(invoice.id).await.unwrap().len(), 2);
        assert!(
            db.record_payment(uuid::Uuid::new_v4(), &payment(dec!(1), admin.id))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn drafts_refuse_payments_and_paid_invoices_resist_deletion() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(db.as_ref(), admin.id, Some(client.id), vec![]).await;
        let due = Utc::now().date_naive() + Duration::days(10);
        let draft = seed_invoice(db.as_ref(), &matter, admin.id, dec!(50), due, true).await;
        let issued = seed_invoice(db.as_ref(), &matter, admin.id, dec!(50), due, false).await;

        let err = db
            .record_payment(draft.id, &payment(dec!(5), admin.id))
            .await
            .expect_err("draft");
        assert!(matches!(err, DatabaseError::Constraint(_)));

        db.record_payment(issued.id, &payment(dec!(5), admin.id))
            .await
            .unwrap();
        let err = db.delete_invoice(issued.id).await.expect_err("has payments");
        assert!(err.is_constraint());
        assert!(db.delete_invoice(draft.id).await.unwrap());

        let err = db.delete_matter(matter.id).await.expect_err("has invoices");
        assert!(err.is_constraint());
        assert_eq!(db.count_invoices_for_matter(matter.id).await.unwrap(), 1);
    }
}
