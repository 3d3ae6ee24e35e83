//! Component C: orders store adapter. Parameterized SQL over
//! customers/orders/order_items/refund_cases (§3.2), with a read-only
//! transaction mode for the verification loop's fallback tools (§4.P).
//!
//! This crate owns connection pooling and row mapping. The SQL-safety
//! policy for the LLM-generated fallback query (§4.P.1) lives in
//! `refund-verification`, which is the crate that actually calls
//! [`OrdersDb::execute_readonly_sql`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refund_core::{Customer, Order, OrderItem, RefundCase, VerificationStatus};
use refund_error::{Classify, ErrorCode};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, FromRow, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrdersDbError {
    #[error("orders database unavailable: {0}")]
    Unavailable(String),
    #[error("order not found for {field}={value}")]
    OrderNotFound { field: String, value: String },
    #[error("customer not found for email {0}")]
    CustomerNotFound(String),
    #[error("identity mismatch: order belongs to a different customer")]
    IdentityMismatch,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Classify for OrdersDbError {
    fn code(&self) -> ErrorCode {
        match self {
            OrdersDbError::Unavailable(_) => ErrorCode::OrdersDbUnavailable,
            OrdersDbError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
            OrdersDbError::CustomerNotFound(_) => ErrorCode::OrderNotFound,
            OrdersDbError::IdentityMismatch => ErrorCode::IdentityMismatch,
            OrdersDbError::InvalidArgument(_) => ErrorCode::ToolArgumentInvalid,
        }
    }
}

#[derive(FromRow)]
struct CustomerRow {
    customer_id: Uuid,
    customer_email: String,
    full_name: String,
    phone: Option<String>,
    membership_tier: Option<String>,
    created_at: DateTime<Utc>,
    metadata: Value,
}

impl From<CustomerRow> for Customer {
    fn from(r: CustomerRow) -> Self {
        Customer {
            customer_id: r.customer_id,
            customer_email: r.customer_email,
            full_name: r.full_name,
            phone: r.phone,
            membership_tier: r.membership_tier,
            created_at: r.created_at,
            metadata: r.metadata,
        }
    }
}

#[derive(FromRow)]
struct OrderRow {
    order_id: Uuid,
    invoice_number: String,
    order_invoice_id: String,
    customer_id: Uuid,
    order_date: Option<DateTime<Utc>>,
    ship_mode: Option<String>,
    ship_city: Option<String>,
    ship_state: Option<String>,
    ship_country: Option<String>,
    currency: String,
    subtotal_amount: f64,
    discount_amount: f64,
    shipping_amount: f64,
    total_amount: f64,
    balance_due: f64,
    refunded_amount: f64,
    order_state: String,
    delivered_at: Option<DateTime<Utc>>,
    seller_type: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(r: OrderRow) -> Self {
        Order {
            order_id: r.order_id,
            invoice_number: r.invoice_number,
            order_invoice_id: r.order_invoice_id,
            customer_id: r.customer_id,
            order_date: r.order_date,
            ship_mode: r.ship_mode,
            ship_city: r.ship_city,
            ship_state: r.ship_state,
            ship_country: r.ship_country,
            currency: r.currency,
            subtotal_amount: r.subtotal_amount,
            discount_amount: r.discount_amount,
            shipping_amount: r.shipping_amount,
            total_amount: r.total_amount,
            balance_due: r.balance_due,
            refunded_amount: r.refunded_amount,
            order_state: r.order_state,
            delivered_at: r.delivered_at,
            seller_type: r.seller_type,
            metadata: r.metadata,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OrderItemRow {
    order_item_id: Uuid,
    order_id: Uuid,
    sku: String,
    item_name: String,
    category: Option<String>,
    subcategory: Option<String>,
    quantity: i32,
    unit_price: f64,
    line_total: f64,
    refunded_qty: i32,
    returned_qty: i32,
    metadata: Value,
}

impl From<OrderItemRow> for OrderItem {
    fn from(r: OrderItemRow) -> Self {
        OrderItem {
            order_item_id: r.order_item_id,
            order_id: r.order_id,
            sku: r.sku,
            item_name: r.item_name,
            category: r.category,
            subcategory: r.subcategory,
            quantity: r.quantity,
            unit_price: r.unit_price,
            line_total: r.line_total,
            refunded_qty: r.refunded_qty,
            returned_qty: r.returned_qty,
            metadata: r.metadata,
        }
    }
}

const ORDER_SELECT_COLUMNS: &str = "o.order_id, o.invoice_number, o.order_invoice_id, o.customer_id, \
    o.order_date, o.ship_mode, o.ship_city, o.ship_state, o.ship_country, o.currency, \
    o.subtotal_amount, o.discount_amount, o.shipping_amount, o.total_amount, o.balance_due, \
    o.refunded_amount, o.order_state, o.delivered_at, o.seller_type, o.metadata, o.created_at, o.updated_at";

const CUSTOMER_SELECT_COLUMNS: &str =
    "c.customer_id, c.customer_email, c.full_name, c.phone, c.membership_tier, c.created_at, c.metadata";

const ORDER_ITEM_SELECT_COLUMNS: &str = "oi.order_item_id, oi.order_id, oi.sku, oi.item_name, oi.category, \
    oi.subcategory, oi.quantity, oi.unit_price, oi.line_total, oi.refunded_qty, oi.returned_qty, oi.metadata";

pub struct FullOrderDetails {
    pub order: Order,
    pub customer: Customer,
    pub items: Vec<OrderItem>,
}

pub struct OrdersDb {
    pool: PgPool,
}

impl OrdersDb {
    pub async fn connect(database_url: &str) -> Result<Self, OrdersDbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        Ok(OrdersDb { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        OrdersDb { pool }
    }

    /// `verify_from_email_matches_customer` tool contract (§4.P).
    pub async fn verify_from_email_matches_customer(
        &self,
        from_email: &str,
    ) -> Result<Option<Customer>, OrdersDbError> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_SELECT_COLUMNS} FROM customers c WHERE lower(c.customer_email) = lower($1) LIMIT 1"
        ))
        .bind(from_email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        Ok(row.map(Customer::from))
    }

    async fn fetch_full_order_details(
        &self,
        field: &str,
        value: &str,
    ) -> Result<Option<FullOrderDetails>, OrdersDbError> {
        if !matches!(field, "order_invoice_id" | "invoice_number") {
            return Err(OrdersDbError::InvalidArgument(format!("unsupported lookup field {field}")));
        }

        let query = format!(
            "SELECT {ORDER_SELECT_COLUMNS}, {CUSTOMER_SELECT_COLUMNS} FROM orders o \
             JOIN customers c ON c.customer_id = o.customer_id \
             WHERE o.{field} = $1 LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };

        let order = OrderRow::from_row(&row).map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        let customer = CustomerRow::from_row(&row).map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        let order_id: Uuid = row.try_get("order_id").map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        let item_rows: Vec<OrderItemRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_ITEM_SELECT_COLUMNS} FROM order_items oi WHERE oi.order_id = $1 ORDER BY oi.item_name ASC"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        Ok(Some(FullOrderDetails {
            order: order.into(),
            customer: customer.into(),
            items: item_rows.into_iter().map(OrderItem::from).collect(),
        }))
    }

    /// `find_order_by_order_invoice_id` tool contract. Cross-checks
    /// `verification_email` against the matched customer when supplied;
    /// a mismatch is reported, not silently ignored, matching the
    /// identity-fraud tripwire the verification loop depends on.
    pub async fn find_order_by_order_invoice_id(
        &self,
        order_invoice_id: &str,
        verification_email: Option<&str>,
    ) -> Result<Option<FullOrderDetails>, OrdersDbError> {
        self.find_with_verification("order_invoice_id", order_invoice_id, verification_email)
            .await
    }

    /// `find_order_by_invoice_number` tool contract.
    pub async fn find_order_by_invoice_number(
        &self,
        invoice_number: &str,
        verification_email: Option<&str>,
    ) -> Result<Option<FullOrderDetails>, OrdersDbError> {
        self.find_with_verification("invoice_number", invoice_number, verification_email)
            .await
    }

    async fn find_with_verification(
        &self,
        field: &str,
        value: &str,
        verification_email: Option<&str>,
    ) -> Result<Option<FullOrderDetails>, OrdersDbError> {
        if value.trim().is_empty() {
            return Err(OrdersDbError::InvalidArgument(format!("{field} must not be empty")));
        }
        let details = self.fetch_full_order_details(field, value).await?;
        let Some(details) = details else { return Ok(None) };

        if let Some(email) = verification_email {
            if details.customer.customer_email.to_lowercase() != email.to_lowercase() {
                return Err(OrdersDbError::IdentityMismatch);
            }
        }
        Ok(Some(details))
    }

    /// `list_orders_by_customer_email` tool contract: clamps limit to
    /// `[1, 100]`, case-insensitive email match, most recent first.
    pub async fn list_orders_by_customer_email(
        &self,
        customer_email: &str,
        limit: i64,
    ) -> Result<Vec<Order>, OrdersDbError> {
        if customer_email.trim().is_empty() {
            return Err(OrdersDbError::InvalidArgument("customer_email must not be empty".into()));
        }
        let limit = limit.clamp(1, 100);

        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_SELECT_COLUMNS} FROM orders o JOIN customers c ON c.customer_id = o.customer_id \
             WHERE lower(c.customer_email) = lower($1) \
             ORDER BY o.order_date DESC NULLS LAST, o.created_at DESC LIMIT $2"
        ))
        .bind(customer_email)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        Ok(rows.into_iter().map(Order::from).collect())
    }

    /// `get_customer_orders_with_items` tool contract.
    pub async fn customer_orders_with_items(
        &self,
        customer_email: &str,
        max_orders: i64,
        max_items_per_order: i64,
    ) -> Result<CustomerOrdersWithItems, OrdersDbError> {
        let max_orders = max_orders.clamp(1, 200);
        let max_items_per_order = max_items_per_order.clamp(1, 500);

        let customer = self.verify_from_email_matches_customer(customer_email).await?;
        let Some(customer) = customer else {
            return Ok(CustomerOrdersWithItems {
                customer: None,
                orders: vec![],
                orders_truncated: false,
                items_truncated: false,
            });
        };

        let orders = self
            .list_orders_by_customer_email(customer_email, max_orders + 1)
            .await?;
        let orders_truncated = orders.len() as i64 > max_orders;
        let orders: Vec<Order> = orders.into_iter().take(max_orders as usize).collect();

        let mut items_truncated = false;
        let mut orders_with_items = Vec::with_capacity(orders.len());
        for order in orders {
            let items = self
                .order_items_by_order_id(order.order_id, max_items_per_order + 1)
                .await?;
            if items.len() as i64 > max_items_per_order {
                items_truncated = true;
            }
            let items: Vec<OrderItem> = items.into_iter().take(max_items_per_order as usize).collect();
            orders_with_items.push((order, items));
        }

        Ok(CustomerOrdersWithItems {
            customer: Some(customer),
            orders: orders_with_items,
            orders_truncated,
            items_truncated,
        })
    }

    async fn order_items_by_order_id(&self, order_id: Uuid, limit: i64) -> Result<Vec<OrderItem>, OrdersDbError> {
        let rows: Vec<OrderItemRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_ITEM_SELECT_COLUMNS} FROM order_items oi WHERE oi.order_id = $1 \
             ORDER BY oi.item_name ASC LIMIT $2"
        ))
        .bind(order_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

    /// `list_order_items_by_order_invoice_id` diagnostic tool contract.
    pub async fn list_order_items_by_order_invoice_id(
        &self,
        order_invoice_id: &str,
        limit: i64,
    ) -> Result<Vec<OrderItem>, OrdersDbError> {
        let limit = limit.clamp(1, 500);
        let order_id: Option<(Uuid,)> = sqlx::query_as("SELECT order_id FROM orders WHERE order_invoice_id = $1")
            .bind(order_invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        let Some((order_id,)) = order_id else {
            return Err(OrdersDbError::OrderNotFound {
                field: "order_invoice_id".into(),
                value: order_invoice_id.into(),
            });
        };
        self.order_items_by_order_id(order_id, limit).await
    }

    /// Executes an LLM-generated, already-validated `SELECT` inside a
    /// read-only, statement-timeout-bounded transaction, for the
    /// `llm_find_orders` last-resort tool (§4.P.1). Validation of the
    /// SQL text itself happens in `refund-verification` before this is
    /// ever called; this method only enforces the transaction guardrails.
    pub async fn execute_readonly_select(
        &self,
        sql: &str,
        params: &[String],
        statement_timeout_ms: u32,
    ) -> Result<Vec<Value>, OrdersDbError> {
        let mut tx = self.pool.begin().await.map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        sqlx::query("SET LOCAL transaction_read_only = on")
            .execute(&mut *tx)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {statement_timeout_ms}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.clone());
        }
        let rows = query
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        tx.rollback().await.map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| row_to_json(&row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e: sqlx::Error| OrdersDbError::Unavailable(e.to_string()))?)
    }

    /// Upserts a refund_case row, enforcing the status-upgrade-only rule
    /// of §5: `verification_status` may go `PENDING_REVIEW -> VERIFIED`
    /// but never the reverse.
    pub async fn upsert_refund_case(&self, case: &RefundCase) -> Result<(), OrdersDbError> {
        let status_rank = |s: VerificationStatus| -> i32 {
            match s {
                VerificationStatus::PendingReview => 0,
                VerificationStatus::Verified => 1,
            }
        };
        let incoming_rank = status_rank(case.verification_status);

        sqlx::query(
            r#"
            INSERT INTO refund_cases (
                case_id, case_source, source_message_id, received_at, from_email, from_name,
                subject, body, customer_id, order_id, extracted_invoice_number,
                extracted_order_invoice_id, classification, confidence, verification_status,
                verification_notes, attachments, metadata, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
            ON CONFLICT (source_message_id) DO UPDATE SET
                verification_notes = EXCLUDED.verification_notes,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at,
                customer_id = CASE
                    WHEN refund_cases.customer_id IS NULL THEN EXCLUDED.customer_id
                    ELSE refund_cases.customer_id
                END,
                order_id = CASE
                    WHEN refund_cases.order_id IS NULL THEN EXCLUDED.order_id
                    ELSE refund_cases.order_id
                END,
                extracted_invoice_number = CASE
                    WHEN refund_cases.extracted_invoice_number IS NULL THEN EXCLUDED.extracted_invoice_number
                    ELSE refund_cases.extracted_invoice_number
                END,
                extracted_order_invoice_id = CASE
                    WHEN refund_cases.extracted_order_invoice_id IS NULL THEN EXCLUDED.extracted_order_invoice_id
                    ELSE refund_cases.extracted_order_invoice_id
                END,
                verification_status = CASE
                    WHEN $21 >= (CASE refund_cases.verification_status
                        WHEN 'VERIFIED' THEN 1 ELSE 0 END)
                    THEN EXCLUDED.verification_status
                    ELSE refund_cases.verification_status
                END
            "#,
        )
        .bind(case.case_id)
        .bind(&case.case_source)
        .bind(&case.source_message_id)
        .bind(case.received_at)
        .bind(&case.from_email)
        .bind(&case.from_name)
        .bind(&case.subject)
        .bind(&case.body)
        .bind(case.customer_id)
        .bind(case.order_id)
        .bind(&case.extracted_invoice_number)
        .bind(&case.extracted_order_invoice_id)
        .bind(format!("{:?}", case.classification).to_uppercase())
        .bind(case.confidence)
        .bind(match case.verification_status {
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::PendingReview => "PENDING_REVIEW",
        })
        .bind(&case.verification_notes)
        .bind(&case.attachments)
        .bind(&case.metadata)
        .bind(case.created_at)
        .bind(case.updated_at)
        .bind(incoming_rank)
        .execute(&self.pool)
        .await
        .map_err(|e| OrdersDbError::Unavailable(e.to_string()))?;

        Ok(())
    }
}

pub struct CustomerOrdersWithItems {
    pub customer: Option<Customer>,
    pub orders: Vec<(Order, Vec<OrderItem>)>,
    pub orders_truncated: bool,
    pub items_truncated: bool,
}

fn row_to_json(row: &sqlx::postgres::PgRow) -> Result<Value, sqlx::Error> {
    use serde_json::Map;
    let mut obj = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value: Value = row
            .try_get::<Option<String>, _>(idx)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .or_else(|_| row.try_get::<Option<i64>, _>(idx).map(|v| v.map(|n| Value::from(n)).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<Option<f64>, _>(idx).map(|v| v.map(|n| Value::from(n)).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::Bool).unwrap_or(Value::Null)))
            .unwrap_or(Value::Null);
        obj.insert(name, value);
    }
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mismatch_is_not_order_not_found() {
        let err = OrdersDbError::IdentityMismatch;
        assert_eq!(err.code(), ErrorCode::IdentityMismatch);
        assert!(err.to_string().contains("identity mismatch"));
    }
}
