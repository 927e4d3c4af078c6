//! Distributor-side execution: stock gating, serial allocation, and the
//! sales order / delivery note documents.

use chrono::Utc;
use serde_json::{json, Value};

use crate::clients::ErpClient;
use crate::errors::{IntegrationError, IntegrationResult};
use crate::services::gateway_settings::GatewaySettings;
use crate::services::line_mapper::MappedLine;
use crate::services::order_normalizer::NormalizedOrder;

/// Outcome of a completed document run.
#[derive(Debug, Clone)]
pub struct FulfillmentResult {
    pub delivery_note: String,
    pub sales_order: Option<String>,
    pub serials: Vec<String>,
    pub line_serials: Vec<Value>,
}

/// Pages serial numbers out of the upstream until a quantity is covered.
pub struct SerialAllocator<'a> {
    client: &'a ErpClient,
    status: String,
}

impl<'a> SerialAllocator<'a> {
    pub fn new(client: &'a ErpClient, status: String) -> Self {
        Self { client, status }
    }

    pub async fn allocate(
        &self,
        item_code: &str,
        quantity: usize,
        warehouse: Option<&str>,
    ) -> IntegrationResult<Vec<String>> {
        let mut serials: Vec<String> = Vec::new();
        let mut offset = 0usize;
        let page_size = (quantity * 2).max(20);

        while serials.len() < quantity {
            let batch = self
                .client
                .list_serial_numbers(item_code, warehouse, &self.status, page_size, offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            for row in batch {
                let serial = row
                    .get("serial_no")
                    .or_else(|| row.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(serial) = serial {
                    if !serials.contains(&serial) {
                        serials.push(serial);
                        if serials.len() == quantity {
                            break;
                        }
                    }
                }
            }
            offset += batch_len;
            if batch_len < page_size {
                break;
            }
        }
        Ok(serials)
    }
}

pub struct FulfillmentExecutor<'a> {
    client: &'a ErpClient,
    settings: &'a GatewaySettings,
}

impl<'a> FulfillmentExecutor<'a> {
    pub fn new(client: &'a ErpClient, settings: &'a GatewaySettings) -> Self {
        Self { client, settings }
    }

    /// Gate the order on upstream availability.
    ///
    /// Default mode checks stock levels per `(item, warehouse)` and leaves
    /// serial assignment to the upstream; with `preallocate_serials` the
    /// allocator reserves concrete serials into the lines instead. Either way
    /// a shortfall surfaces as [`IntegrationError::Backorder`].
    pub async fn ensure_availability(
        &self,
        lines: &mut [MappedLine],
        order_id: &str,
    ) -> IntegrationResult<()> {
        if self.settings.preallocate_serials() {
            self.allocate_serials(lines).await
        } else {
            self.check_stock(lines, order_id).await
        }
    }

    async fn check_stock(&self, lines: &[MappedLine], order_id: &str) -> IntegrationResult<()> {
        let mut insufficient: Vec<String> = Vec::new();
        for line in lines {
            if line.quantity <= 0.0 {
                continue;
            }
            let rows = self
                .client
                .list_stock_levels(&line.target_item_code, line.warehouse.as_deref(), order_id)
                .await?;
            let available = available_qty(&rows);
            if available < line.quantity {
                tracing::info!(
                    item_code = %line.target_item_code,
                    warehouse = line.warehouse.as_deref().unwrap_or("<any>"),
                    required = line.quantity,
                    available,
                    "insufficient stock for fulfillment line"
                );
                insufficient.push(line.target_item_code.clone());
            }
        }
        if !insufficient.is_empty() {
            insufficient.sort();
            insufficient.dedup();
            return Err(IntegrationError::Backorder(format!(
                "insufficient stock for: {}",
                insufficient.join(", ")
            )));
        }
        Ok(())
    }

    async fn allocate_serials(&self, lines: &mut [MappedLine]) -> IntegrationResult<()> {
        let allocator = SerialAllocator::new(self.client, self.settings.serial_status());
        let mut insufficient: Vec<String> = Vec::new();
        for line in lines.iter_mut() {
            let quantity = line.quantity as usize;
            if quantity == 0 {
                continue;
            }
            let serials = allocator
                .allocate(&line.target_item_code, quantity, line.warehouse.as_deref())
                .await?;
            if serials.len() < quantity {
                insufficient.push(line.target_item_code.clone());
            } else {
                line.serial_numbers = serials;
            }
        }
        if !insufficient.is_empty() {
            insufficient.sort();
            insufficient.dedup();
            return Err(IntegrationError::Backorder(format!(
                "not enough serial numbers for: {}",
                insufficient.join(", ")
            )));
        }
        Ok(())
    }

    /// Insert the sales order, unless the tenant disabled it.
    pub async fn create_sales_order(
        &self,
        order: &NormalizedOrder,
        lines: &[MappedLine],
    ) -> IntegrationResult<Option<String>> {
        if !self.settings.create_sales_order() {
            return Ok(None);
        }

        let payload = sales_order_payload(order, lines);
        let response = self
            .client
            .insert_doc("Sales Order", &payload, &order.order_id)
            .await?;
        let name = response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        match name {
            Some(name) => Ok(Some(name)),
            None => Err(IntegrationError::fulfillment(
                "sales_order_creation",
                "the upstream did not return a sales order name",
            )),
        }
    }

    /// Insert and submit the delivery note referencing the sales order.
    pub async fn create_delivery_note(
        &self,
        order: &NormalizedOrder,
        lines: &[MappedLine],
        sales_order_name: Option<&str>,
    ) -> IntegrationResult<FulfillmentResult> {
        let payload = delivery_note_payload(order, lines, sales_order_name);
        let response = self
            .client
            .insert_doc("Delivery Note", &payload, &order.order_id)
            .await?;
        let delivery_note_name = response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                IntegrationError::fulfillment(
                    "delivery_note_creation",
                    "the upstream did not return a delivery note name",
                )
            })?;

        let submit_response = self
            .client
            .submit_doc("Delivery Note", &delivery_note_name)
            .await?;
        if submit_response.get("docstatus").and_then(Value::as_i64) != Some(1) {
            return Err(IntegrationError::fulfillment(
                "delivery_note_submit",
                format!("delivery note {delivery_note_name} was not committed on submit"),
            ));
        }

        let serials: Vec<String> = lines
            .iter()
            .flat_map(|line| line.serial_numbers.iter().cloned())
            .collect();
        let line_serials = lines
            .iter()
            .map(|line| {
                json!({
                    "item_code": line.target_item_code,
                    "serials": line.serial_numbers,
                    "warehouse": line.warehouse,
                    "quantity": line.quantity,
                })
            })
            .collect();

        Ok(FulfillmentResult {
            delivery_note: delivery_note_name,
            sales_order: sales_order_name.map(str::to_string),
            serials,
            line_serials,
        })
    }
}

fn available_qty(rows: &[Value]) -> f64 {
    rows.iter()
        .map(|row| match row.get("actual_qty") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        })
        .sum()
}

fn document_date(order: &NormalizedOrder) -> String {
    order
        .created_at
        .or(order.paid_at)
        .unwrap_or_else(Utc::now)
        .date_naive()
        .to_string()
}

fn sales_order_payload(order: &NormalizedOrder, lines: &[MappedLine]) -> Value {
    json!({
        "doctype": "Sales Order",
        "company": order.distributor_company,
        "customer": order.seller_company,
        "delivery_date": document_date(order),
        "po_no": order.order_id,
        "custom_customer_email": order.customer_email,
        "custom_order_ref": order.order_id,
        "items": lines
            .iter()
            .map(|line| json!({
                "item_code": line.target_item_code,
                "qty": line.quantity,
                "warehouse": line.warehouse,
                "rate": line.unit_price,
            }))
            .collect::<Vec<_>>(),
    })
}

fn delivery_note_payload(
    order: &NormalizedOrder,
    lines: &[MappedLine],
    sales_order_name: Option<&str>,
) -> Value {
    let items: Vec<Value> = lines
        .iter()
        .map(|line| {
            let mut item = json!({
                "item_code": line.target_item_code,
                "qty": line.quantity,
                "warehouse": line.warehouse,
            });
            if !line.serial_numbers.is_empty() {
                item["serial_no"] = json!(line.serial_numbers.join("\n"));
            }
            if let Some(sales_order) = sales_order_name {
                item["against_sales_order"] = json!(sales_order);
            }
            item
        })
        .collect();

    json!({
        "doctype": "Delivery Note",
        "company": order.distributor_company,
        "customer": order.seller_company,
        "posting_date": document_date(order),
        "custom_customer_email": order.customer_email,
        "custom_order_ref": order.order_id,
        "items": items,
    })
}
