//! Invoices, payments and the CSV export.
//!
//! Status is never stored: every response runs `infer_status` against
//! today's date, so filtering by status happens after the rows are loaded.

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::Response,
};
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    ActivityAction, CreateInvoiceParams, CreatePaymentParams, Database, EntityType,
    InvoiceFilter, InvoiceRecord, Paged, Role, UpdateInvoiceParams, UserRecord, Visibility,
};
use crate::error::DatabaseError;
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::billing::{
    InvoiceStatus, PaymentRejection, amounts_editable, build_line_items, compute_totals,
    infer_status, validate_payment,
};
use crate::legal::normalize::{empty_to_none, normalize_reference};
use crate::legal::numbering::{INVOICE_PREFIX, next_number, year_prefix};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiError, ApiResult, bad_request, db_conflict, db_error, deny, not_found, page_of,
    referenced_matter, require_staff,
};
use crate::web::server::AppState;
use crate::web::types::{
    CreateInvoiceRequest, InvoiceDetail, InvoiceListQuery, InvoiceView, PagedResponse,
    PaymentRequest, PaymentResponse, PaymentView, UpdateInvoiceRequest, money_string,
};

const NUMBER_TAKEN: &str = "An invoice with this number already exists";
const NUMBERING_ATTEMPTS: usize = 3;

fn conflict(message: impl Into<String>) -> ApiError {
    (StatusCode::CONFLICT, message.into())
}

/// Staff see every invoice, clients their own; members are refused.
fn billing_scope(state: &AppState, user: &UserRecord, action: &str) -> ApiResult<Visibility> {
    match user.role {
        Role::SuperAdmin | Role::Admin => Ok(Visibility::All),
        Role::Client => Ok(Visibility::Client(user.id)),
        Role::Member => Err(deny(state, user, action)),
    }
}

async fn load_visible(state: &AppState, user: &UserRecord, id: Uuid) -> ApiResult<InvoiceRecord> {
    let visibility = billing_scope(state, user, "view_invoice")?;
    let invoice = state
        .db
        .get_invoice(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Invoice", id))?;
    match visibility {
        Visibility::Client(client_id) if invoice.client_id != client_id => {
            Err(not_found("Invoice", id))
        }
        _ => Ok(invoice),
    }
}

fn view(state: &AppState, invoice: &InvoiceRecord, today: NaiveDate) -> InvoiceView {
    InvoiceView::new(
        invoice,
        infer_status(invoice, today, state.billing.due_soon_days),
    )
}

fn parse_status(raw: Option<&str>) -> ApiResult<Option<InvoiceStatus>> {
    match empty_to_none(raw) {
        None => Ok(None),
        Some(raw) => InvoiceStatus::parse(&raw).map(Some).ok_or_else(|| {
            bad_request(format!(
                "unknown invoice status '{raw}'; expected one of {}",
                InvoiceStatus::ALL.map(InvoiceStatus::as_str).join(", ")
            ))
        }),
    }
}

/// Load the invoices in scope and keep those whose inferred status matches.
async fn scoped_invoices(
    state: &AppState,
    visibility: Visibility,
    query: &InvoiceListQuery,
    today: NaiveDate,
) -> ApiResult<Vec<InvoiceView>> {
    let status = parse_status(query.status.as_deref())?;
    let rows = state
        .db
        .list_invoices(&InvoiceFilter {
            visibility,
            matter_id: query.matter_id,
            client_id: query.client_id,
        })
        .await
        .map_err(db_error)?;
    Ok(rows
        .iter()
        .map(|invoice| view(state, invoice, today))
        .filter(|invoice| status.is_none_or(|wanted| invoice.status == wanted))
        .collect())
}

fn check_dates(issue_date: Option<NaiveDate>, due_date: NaiveDate) -> ApiResult<()> {
    match issue_date {
        Some(issued) if due_date < issued => Err(bad_request(
            "due_date must be on or after issue_date",
        )),
        _ => Ok(()),
    }
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<InvoiceListQuery>,
) -> ApiResult<Json<PagedResponse<InvoiceView>>> {
    let visibility = billing_scope(&state, &user, "list_invoices")?;
    let page = page_of(query.page, query.limit);
    let all = scoped_invoices(&state, visibility, &query, Utc::now().date_naive()).await?;

    let total = all.len() as i64;
    let items = all
        .into_iter()
        .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
        .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
        .collect();
    Ok(Json(PagedResponse::new(Paged { items, total }, page)))
}

pub async fn export_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<InvoiceListQuery>,
) -> ApiResult<Response> {
    require_staff(&state, &user, "export_invoices")?;
    let invoices =
        scoped_invoices(&state, Visibility::All, &query, Utc::now().date_naive()).await?;
    let csv = write_csv(&invoices).map_err(|e| {
        tracing::error!("invoice export failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build export".to_string(),
        )
    })?;
    tracing::info!(rows = invoices.len(), "invoices exported");

    Response::builder()
        .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
        .header(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"invoices.csv\"",
        )
        .body(Body::from(csv))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn write_csv(invoices: &[InvoiceView]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "invoice_number",
        "matter_id",
        "client_id",
        "status",
        "issue_date",
        "due_date",
        "subtotal",
        "tax",
        "discount",
        "total",
        "amount_paid",
        "balance",
    ])?;
    for invoice in invoices {
        writer.write_record([
            invoice.invoice_number.clone(),
            invoice.matter_id.to_string(),
            invoice.client_id.to_string(),
            invoice.status.as_str().to_string(),
            invoice.issue_date.map(|d| d.to_string()).unwrap_or_default(),
            invoice.due_date.to_string(),
            invoice.subtotal.clone(),
            invoice.tax.clone(),
            invoice.discount.clone(),
            invoice.total.clone(),
            invoice.amount_paid.clone(),
            invoice.balance.clone(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceDetail>> {
    let invoice = load_visible(&state, &user, id).await?;
    let payments = state.db.list_payments(id).await.map_err(db_error)?;
    Ok(Json(InvoiceDetail {
        invoice: view(&state, &invoice, Utc::now().date_naive()),
        payments: payments.iter().map(PaymentView::from).collect(),
    }))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateInvoiceRequest>,
) -> ApiResult<(StatusCode, Json<InvoiceView>)> {
    require_staff(&state, &actor, "create_invoice")?;
    let today = Utc::now().date_naive();

    let matter = referenced_matter(state.db.as_ref(), &actor, req.matter_id).await?;
    let client_id = matter.client_id.ok_or_else(|| {
        bad_request(format!(
            "Matter {} has no client to bill",
            matter.matter_number
        ))
    })?;

    let is_draft = req.is_draft.unwrap_or(true);
    let issue_date = if is_draft {
        req.issue_date
    } else {
        req.issue_date.or(Some(today))
    };
    check_dates(issue_date, req.due_date)?;

    let line_items = build_line_items(&req.line_items).map_err(bad_request)?;
    let tax_rate = req.tax_rate.unwrap_or(state.billing.default_tax_rate);
    let discount = req.discount.unwrap_or(Decimal::ZERO);
    let totals = compute_totals(&line_items, tax_rate, discount).map_err(bad_request)?;

    let mut params = CreateInvoiceParams {
        invoice_number: String::new(),
        matter_id: matter.id,
        client_id,
        issue_date,
        due_date: req.due_date,
        line_items,
        subtotal: totals.subtotal,
        tax_rate,
        tax: totals.tax,
        discount,
        total: totals.total,
        is_draft,
        notes: empty_to_none(req.notes.as_deref()),
        created_by: actor.id,
    };
    let created = match normalize_reference(req.invoice_number.as_deref()) {
        Some(number) => {
            params.invoice_number = number;
            state
                .db
                .create_invoice(&params)
                .await
                .map_err(db_conflict(NUMBER_TAKEN))?
        }
        None => create_numbered(state.db.as_ref(), &mut params, today.year()).await?,
    };

    Entry::new(
        actor.id,
        EntityType::Invoice,
        created.id,
        ActivityAction::Created,
        format!(
            "{} created invoice {} for {}",
            actor.name, created.invoice_number, matter.matter_number
        ),
    )
    .changes(snapshot(&created, true))
    .notify(Some(client_id).filter(|_| !created.is_draft))
    .record(state.db.as_ref())
    .await;
    tracing::info!(invoice_id = %created.id, number = %created.invoice_number, "invoice created");

    Ok((StatusCode::CREATED, Json(view(&state, &created, today))))
}

async fn create_numbered(
    db: &dyn Database,
    params: &mut CreateInvoiceParams,
    year: i32,
) -> ApiResult<InvoiceRecord> {
    let prefix = year_prefix(INVOICE_PREFIX, year);
    for attempt in 1..=NUMBERING_ATTEMPTS {
        let existing = db
            .invoice_numbers_with_prefix(&prefix)
            .await
            .map_err(db_error)?;
        params.invoice_number = next_number(INVOICE_PREFIX, year, &existing);
        match db.create_invoice(params).await {
            Ok(invoice) => return Ok(invoice),
            Err(DatabaseError::Constraint(detail)) if attempt < NUMBERING_ATTEMPTS => {
                tracing::debug!(attempt, "invoice number collision, retrying: {}", detail);
            }
            Err(e) => return Err(db_conflict(NUMBER_TAKEN)(e)),
        }
    }
    Err(conflict("Could not allocate an invoice number"))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateInvoiceRequest>,
) -> ApiResult<Json<InvoiceView>> {
    require_staff(&state, &actor, "update_invoice")?;
    let before = load_visible(&state, &actor, id).await?;

    let touches_amounts =
        req.line_items.is_some() || req.tax_rate.is_some() || req.discount.is_some();
    if touches_amounts && !amounts_editable(&before) {
        return Err(conflict(
            "Amounts cannot change once payments have been recorded",
        ));
    }
    if req.is_draft == Some(false) && before.is_draft {
        return Err(bad_request(format!(
            "Issue invoice {} with POST /api/invoices/{id}/issue",
            before.invoice_number
        )));
    }
    if req.is_draft == Some(true) && !before.is_draft && before.amount_paid > Decimal::ZERO {
        return Err(conflict(
            "An invoice with payments cannot return to draft",
        ));
    }

    let mut params = UpdateInvoiceParams::default();
    if touches_amounts {
        let line_items = match &req.line_items {
            Some(items) => build_line_items(items).map_err(bad_request)?,
            None => before.line_items.clone(),
        };
        let tax_rate = req.tax_rate.unwrap_or(before.tax_rate);
        let discount = req.discount.unwrap_or(before.discount);
        let totals = compute_totals(&line_items, tax_rate, discount).map_err(bad_request)?;
        params.line_items = Some(line_items);
        params.tax_rate = Some(tax_rate);
        params.discount = Some(discount);
        params.subtotal = Some(totals.subtotal);
        params.tax = Some(totals.tax);
        params.total = Some(totals.total);
    }

    let issue_date = req.issue_date.unwrap_or(before.issue_date);
    let due_date = req.due_date.unwrap_or(before.due_date);
    check_dates(issue_date, due_date)?;
    params.issue_date = req.issue_date;
    params.due_date = req.due_date;
    params.is_draft = req.is_draft;
    if let Some(notes) = &req.notes {
        params.notes = Some(empty_to_none(notes.as_deref()));
    }

    let after = state
        .db
        .update_invoice(id, &params)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Invoice", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        Entry::new(
            actor.id,
            EntityType::Invoice,
            after.id,
            ActivityAction::Updated,
            format!("{} updated invoice {}", actor.name, after.invoice_number),
        )
        .changes(changes)
        .record(state.db.as_ref())
        .await;
    }
    Ok(Json(view(&state, &after, Utc::now().date_naive())))
}

pub async fn issue_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceView>> {
    require_staff(&state, &actor, "issue_invoice")?;
    let before = load_visible(&state, &actor, id).await?;
    if !before.is_draft {
        return Err(conflict(format!(
            "Invoice {} has already been issued",
            before.invoice_number
        )));
    }
    let today = Utc::now().date_naive();
    let issue_date = before.issue_date.unwrap_or(today);
    check_dates(Some(issue_date), before.due_date)?;

    let after = state
        .db
        .update_invoice(
            id,
            &UpdateInvoiceParams {
                is_draft: Some(false),
                issue_date: Some(Some(issue_date)),
                ..UpdateInvoiceParams::default()
            },
        )
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Invoice", id))?;

    Entry::new(
        actor.id,
        EntityType::Invoice,
        after.id,
        ActivityAction::StatusChanged,
        format!("{} issued invoice {}", actor.name, after.invoice_number),
    )
    .changes(diff_fields(&before, &after))
    .notify([after.client_id])
    .record(state.db.as_ref())
    .await;
    Ok(Json(view(&state, &after, today)))
}

pub async fn payments_list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<PaymentView>>> {
    load_visible(&state, &user, id).await?;
    let payments = state.db.list_payments(id).await.map_err(db_error)?;
    Ok(Json(payments.iter().map(PaymentView::from).collect()))
}

pub async fn payment_create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<PaymentRequest>,
) -> ApiResult<(StatusCode, Json<PaymentResponse>)> {
    require_staff(&state, &actor, "record_payment")?;
    let before = load_visible(&state, &actor, id).await?;
    let amount = validate_payment(&before, req.amount).map_err(|rejection| match rejection {
        PaymentRejection::Draft => conflict(rejection.to_string()),
        PaymentRejection::NotPositive | PaymentRejection::ExceedsBalance { .. } => {
            bad_request(rejection.to_string())
        }
    })?;
    let today = Utc::now().date_naive();

    let (after, payment) = state
        .db
        .record_payment(
            id,
            &CreatePaymentParams {
                amount,
                paid_on: req.paid_on.unwrap_or(today),
                method: empty_to_none(req.method.as_deref()),
                reference: empty_to_none(req.reference.as_deref()),
                recorded_by: actor.id,
            },
        )
        .await
        .map_err(db_conflict("Invoice changed while recording the payment; retry"))?
        .ok_or_else(|| not_found("Invoice", id))?;

    Entry::new(
        actor.id,
        EntityType::Invoice,
        after.id,
        ActivityAction::PaymentRecorded,
        format!(
            "{} recorded a payment of {} on invoice {}",
            actor.name,
            money_string(payment.amount),
            after.invoice_number
        ),
    )
    .changes(diff_fields(&before, &after))
    .notify([after.client_id])
    .record(state.db.as_ref())
    .await;
    tracing::info!(invoice_id = %id, amount = %payment.amount, "payment recorded");

    Ok((
        StatusCode::CREATED,
        Json(PaymentResponse {
            invoice: view(&state, &after, today),
            payment: PaymentView::from(&payment),
        }),
    ))
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_staff(&state, &actor, "delete_invoice")?;
    let invoice = load_visible(&state, &actor, id).await?;
    if !state.db.list_payments(id).await.map_err(db_error)?.is_empty() {
        return Err(conflict(format!(
            "Invoice {} has recorded payments and cannot be deleted",
            invoice.invoice_number
        )));
    }
    if !state
        .db
        .delete_invoice(id)
        .await
        .map_err(db_conflict("Invoice has recorded payments"))?
    {
        return Err(not_found("Invoice", id));
    }
    Entry::new(
        actor.id,
        EntityType::Invoice,
        id,
        ActivityAction::Deleted,
        format!("{} deleted invoice {}", actor.name, invoice.invoice_number),
    )
    .changes(snapshot(&invoice, false))
    .record(state.db.as_ref())
    .await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::MatterRecord;
    use crate::legal::billing::LineItemInput;
    use crate::testing::{seed_invoice, seed_matter, seed_user, test_state};

    async fn billed_matter(state: &AppState) -> (UserRecord, UserRecord, MatterRecord) {
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, Some(client.id), vec![]).await;
        (admin, client, matter)
    }

    fn create_req(matter_id: Uuid, due_date: NaiveDate) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            invoice_number: None,
            matter_id,
            issue_date: None,
            due_date,
            line_items: vec![
                LineItemInput {
                    description: "Drafting".into(),
                    quantity: dec!(2.5),
                    unit_price: dec!(200),
                },
                LineItemInput {
                    description: "Filing fee".into(),
                    quantity: dec!(1),
                    unit_price: dec!(45.333),
                },
            ],
            tax_rate: Some(dec!(10)),
            discount: Some(dec!(5)),
            is_draft: Some(false),
            notes: None,
        }
    }

    #[tokio::test]
    async fn create_computes_totals_and_numbers() {
        let (state, _dir) = test_state().await;
        let (admin, client, matter) = billed_matter(&state).await;
        let today = Utc::now().date_naive();

        let (status, Json(invoice)) = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Json(create_req(matter.id, today + Duration::days(30))),
        )
        .await
        .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(invoice.invoice_number, format!("INV-{}-0001", today.year()));
        assert_eq!(invoice.client_id, client.id);
        assert_eq!(invoice.subtotal, "545.33");
        assert_eq!(invoice.tax, "54.53");
        assert_eq!(invoice.total, "594.86");
        assert_eq!(invoice.balance, "594.86");
        assert_eq!(invoice.issue_date, Some(today));
        assert_eq!(invoice.status, InvoiceStatus::PaymentDue);
    }

    #[tokio::test]
    async fn matter_without_client_cannot_be_billed() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let err = create_handler(
            State(state),
            Extension(CurrentUser(admin)),
            Json(create_req(matter.id, Utc::now().date_naive())),
        )
        .await
        .expect_err("no client");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn due_date_cannot_precede_issue_date() {
        let (state, _dir) = test_state().await;
        let (admin, _, matter) = billed_matter(&state).await;
        let err = create_handler(
            State(state),
            Extension(CurrentUser(admin)),
            Json(create_req(matter.id, Utc::now().date_naive() - Duration::days(1))),
        )
        .await
        .expect_err("due before issue");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn drafts_are_issued_only_through_issue() {
        let (state, _dir) = test_state().await;
        let (admin, client, matter) = billed_matter(&state).await;
        let due = Utc::now().date_naive() + Duration::days(30);
        let draft = seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(80), due, true).await;

        let err = update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(draft.id),
            Json(UpdateInvoiceRequest {
                is_draft: Some(false),
                ..Default::default()
            }),
        )
        .await
        .expect_err("update cannot issue");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("/issue"), "{}", err.1);
        let unchanged = state.db.get_invoice(draft.id).await.unwrap().unwrap();
        assert!(unchanged.is_draft);
        assert_eq!(state.db.count_unread_notifications(client.id).await.unwrap(), 0);

        let Json(issued) = issue_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(draft.id),
        )
        .await
        .expect("issue");
        assert_eq!(issued.issue_date, Some(Utc::now().date_naive()));
        assert_eq!(state.db.count_unread_notifications(client.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_line_items_are_rejected() {
        let (state, _dir) = test_state().await;
        let (admin, _, matter) = billed_matter(&state).await;
        let mut req = create_req(matter.id, Utc::now().date_naive() + Duration::days(30));
        req.line_items[0].quantity = Decimal::MAX;
        let err = create_handler(State(state), Extension(CurrentUser(admin)), Json(req))
            .await
            .expect_err("overflow");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("amount out of range"), "{}", err.1);
    }

    #[tokio::test]
    async fn payments_move_status_and_lock_amounts() {
        let (state, _dir) = test_state().await;
        let (admin, client, matter) = billed_matter(&state).await;
        let due = Utc::now().date_naive() + Duration::days(60);
        let invoice = seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(100), due, false).await;

        let pay = |amount: Decimal| {
            payment_create_handler(
                State(Arc::clone(&state)),
                Extension(CurrentUser(admin.clone())),
                Path(invoice.id),
                Json(PaymentRequest {
                    amount,
                    paid_on: None,
                    method: Some("wire".into()),
                    reference: None,
                }),
            )
        };

        let err = pay(dec!(0)).await.expect_err("zero");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        let err = pay(dec!(100.01)).await.expect_err("over balance");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let (_, Json(partial)) = pay(dec!(40)).await.expect("partial");
        assert_eq!(partial.invoice.status, InvoiceStatus::Partial);
        assert_eq!(partial.invoice.balance, "60.00");
        assert_eq!(partial.payment.amount, "40.00");

        let err = update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(invoice.id),
            Json(UpdateInvoiceRequest {
                discount: Some(dec!(10)),
                ..Default::default()
            }),
        )
        .await
        .expect_err("amounts locked");
        assert_eq!(err.0, StatusCode::CONFLICT);

        let (_, Json(paid)) = pay(dec!(60)).await.expect("rest");
        assert_eq!(paid.invoice.status, InvoiceStatus::Paid);

        let err = delete_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(invoice.id),
        )
        .await
        .expect_err("has payments");
        assert_eq!(err.0, StatusCode::CONFLICT);

        assert_eq!(state.db.count_unread_notifications(client.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn drafts_must_be_issued_before_payment() {
        let (state, _dir) = test_state().await;
        let (admin, _, matter) = billed_matter(&state).await;
        let due = Utc::now().date_naive() + Duration::days(3);
        let draft = seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(80), due, true).await;

        let err = payment_create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(draft.id),
            Json(PaymentRequest {
                amount: dec!(10),
                paid_on: None,
                method: None,
                reference: None,
            }),
        )
        .await
        .expect_err("draft");
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(issued) = issue_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(draft.id),
        )
        .await
        .expect("issue");
        assert!(!issued.is_draft);
        assert_eq!(issued.issue_date, Some(Utc::now().date_naive()));
        assert_eq!(issued.status, InvoiceStatus::DueSoon);

        let err = issue_handler(State(state), Extension(CurrentUser(admin)), Path(draft.id))
            .await
            .expect_err("twice");
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn scope_and_status_filter() {
        let (state, _dir) = test_state().await;
        let (admin, client, matter) = billed_matter(&state).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let other_client = seed_user(state.db.as_ref(), "Olga Other", Role::Client).await;
        let other = seed_matter(state.db.as_ref(), admin.id, Some(other_client.id), vec![]).await;
        let today = Utc::now().date_naive();
        seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(10), today - Duration::days(1), false).await;
        seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(20), today + Duration::days(90), false).await;
        let hidden =
            seed_invoice(state.db.as_ref(), &other, admin.id, dec!(30), today, false).await;

        let Json(own) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client.clone())),
            Query(InvoiceListQuery::default()),
        )
        .await
        .expect("client list");
        assert_eq!(own.total, 2);

        let Json(overdue) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Query(InvoiceListQuery {
                status: Some("OVERDUE".into()),
                ..Default::default()
            }),
        )
        .await
        .expect("overdue");
        assert_eq!(overdue.total, 1);
        assert_eq!(overdue.items[0].total, "10.00");

        let err = get_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client)),
            Path(hidden.id),
        )
        .await
        .expect_err("other client's invoice");
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member)),
            Query(InvoiceListQuery::default()),
        )
        .await
        .expect_err("members");
        assert_eq!(err.0, StatusCode::FORBIDDEN);

        let err = list_handler(
            State(state),
            Extension(CurrentUser(admin)),
            Query(InvoiceListQuery {
                status: Some("settled".into()),
                ..Default::default()
            }),
        )
        .await
        .expect_err("unknown status");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_writes_one_row_per_invoice() {
        let (state, _dir) = test_state().await;
        let (admin, _, matter) = billed_matter(&state).await;
        let due = Utc::now().date_naive() + Duration::days(30);
        let invoice = seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(12.5), due, false).await;

        let response = export_handler(
            State(state),
            Extension(CurrentUser(admin)),
            Query(InvoiceListQuery::default()),
        )
        .await
        .expect("export");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("invoice_number,matter_id"));
        assert!(lines[1].starts_with(&invoice.invoice_number));
        assert!(lines[1].ends_with("12.50,0.00,12.50"));
    }
}
