//! Synchronization of submitted ERP invoices into the accounting upstream:
//! resolve (or create) the contact, assemble the invoice document, POST it.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::clients::AccountingClient;
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{AccountingCredential, IntegrationMessage};

/// Identification types whose numbers must be digit-only.
const NUMERIC_IDENTIFICATION_TYPES: [&str; 4] = ["CC", "NIT", "TI", "CE"];

struct ContactData {
    id: String,
}

/// Process one submitted source invoice end to end.
pub async fn process_invoice_message(
    pool: &PgPool,
    message: &IntegrationMessage,
) -> IntegrationResult<Value> {
    let payload = &message.payload;
    let company = payload.get("company").and_then(Value::as_str);

    let client =
        AccountingClient::for_organization(pool, message.organization_id, company).await?;

    let contact = ensure_contact(&client, payload).await?;
    let invoice_payload = build_invoice_payload(payload, &contact.id, client.credential())?;

    let external_reference = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            payload
                .get("external_reference")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| message.id.to_string());

    let response = client
        .create_invoice(&invoice_payload, &external_reference)
        .await?;

    tracing::info!(
        organization_id = %message.organization_id,
        external_reference = %external_reference,
        invoice_id = response.get("id").map(|v| v.to_string()).unwrap_or_default(),
        "created accounting invoice"
    );

    Ok(json!({
        "invoice_payload": invoice_payload,
        "invoice_response": response,
    }))
}

/// Customer fields pulled out of the source payload, either from a nested
/// `customer` object or from the flat webhook form.
struct CustomerData {
    code: Option<String>,
    name: String,
    accounting_id: Option<String>,
    identification_type: Option<String>,
    identification: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    address: Value,
}

fn customer_data(payload: &Value) -> CustomerData {
    let nested = payload.get("customer").filter(|c| c.is_object());
    let nested_str = |key: &str| -> Option<String> {
        nested
            .and_then(|c| c.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    // Flat webhook form: customer fields live at the payload top level under
    // ERP-specific names.
    let flat_str = |key: &str| -> Option<String> {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let code = nested_str("code")
        .or_else(|| {
            payload
                .get("customer")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| flat_str("customer_code"));

    CustomerData {
        code,
        name: nested_str("name")
            .or_else(|| flat_str("customer_name"))
            .unwrap_or_else(|| "Customer".to_string()),
        accounting_id: nested_str("custom_accounting_id")
            .or_else(|| flat_str("custom_accounting_id")),
        identification_type: nested_str("identification_type")
            .or_else(|| flat_str("custom_document_type")),
        identification: nested_str("identification").or_else(|| flat_str("tax_id")),
        email: nested_str("email").or_else(|| flat_str("contact_email")),
        phone: nested_str("phone").or_else(|| flat_str("contact_mobile")),
        address: nested
            .and_then(|c| c.get("address"))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

/// Resolve the accounting contact for the invoice: known id, then searches by
/// identification, customer code, and email (first match wins), else create.
/// A failed create re-runs the search once to close the race window.
async fn ensure_contact(
    client: &AccountingClient,
    payload: &Value,
) -> IntegrationResult<ContactData> {
    let customer = customer_data(payload);

    if let Some(found) = find_contact(client, &customer).await {
        maybe_update_contact(client, &found, &customer).await;
        let id = contact_id(&found).unwrap_or_default();
        return Ok(ContactData { id });
    }

    let create_payload = build_contact_payload(&customer, client.credential());
    let reference = customer
        .code
        .clone()
        .unwrap_or_else(|| customer.name.clone());
    match client.create_contact(&create_payload, &reference).await {
        Ok(created) => match contact_id(&created) {
            Some(id) => Ok(ContactData { id }),
            None => Err(IntegrationError::Api {
                message: "the accounting upstream returned no contact id on create".into(),
                status_code: None,
                error_code: "unknown_error".into(),
                retryable: false,
                body: created,
            }),
        },
        Err(create_err) => {
            tracing::warn!(error = %create_err, "contact creation failed, re-running search");
            if let Some(found) = find_contact(client, &customer).await {
                let id = contact_id(&found).unwrap_or_default();
                return Ok(ContactData { id });
            }
            Err(create_err)
        }
    }
}

async fn find_contact(client: &AccountingClient, customer: &CustomerData) -> Option<Value> {
    let reference = customer.code.clone().unwrap_or_else(|| customer.name.clone());

    if let Some(known_id) = &customer.accounting_id {
        match client.get_contact(known_id, &reference).await {
            Ok(contact) if contact_id(&contact).is_some() => return Some(contact),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(contact_id = %known_id, error = %err, "contact fetch by id failed");
            }
        }
    }

    let mut terms: Vec<&String> = Vec::new();
    if let Some(identification) = &customer.identification {
        terms.push(identification);
    }
    if let Some(code) = &customer.code {
        terms.push(code);
    }
    if let Some(email) = &customer.email {
        terms.push(email);
    }
    let name = customer.name.clone();
    if terms.is_empty() {
        terms.push(&name);
    }

    for term in terms {
        let matches = match client.search_contacts(term, &reference).await {
            Ok(matches) => matches,
            Err(err) => {
                tracing::warn!(term = %term, error = %err, "contact search failed");
                continue;
            }
        };
        if let Some(found) = match_contact(&matches, customer) {
            return Some(found);
        }
    }
    None
}

/// Pick the search result that actually belongs to this customer: matching
/// known id, identification number, or email.
fn match_contact(matches: &Value, customer: &CustomerData) -> Option<Value> {
    let rows = matches.as_array()?;
    let identifiers: Vec<&str> = [&customer.identification, &customer.code]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect();

    for contact in rows {
        if let Some(known_id) = &customer.accounting_id {
            if contact_id(contact).as_deref() == Some(known_id.as_str()) {
                return Some(contact.clone());
            }
        }
        let number = contact
            .get("identificationObject")
            .and_then(|o| o.get("number"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !number.is_empty() && identifiers.contains(&number) {
            return Some(contact.clone());
        }
        if let Some(email) = &customer.email {
            if contact.get("email").and_then(Value::as_str) == Some(email.as_str()) {
                return Some(contact.clone());
            }
        }
    }
    None
}

fn contact_id(contact: &Value) -> Option<String> {
    match contact.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// PUT the diff when local data drifted from the stored contact. Best effort:
/// failures are logged and swallowed.
async fn maybe_update_contact(client: &AccountingClient, contact: &Value, customer: &CustomerData) {
    let mut updates = Map::new();

    let name_object = contact.get("nameObject").cloned().unwrap_or(Value::Null);
    let current_name = [
        name_object.get("firstName").and_then(Value::as_str),
        name_object.get("lastName").and_then(Value::as_str),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
    if !customer.name.trim().is_empty() && customer.name.trim() != current_name.trim() {
        let (first_name, last_name) = split_name(&customer.name);
        updates.insert(
            "nameObject".into(),
            json!({
                "firstName": first_name,
                "lastName": last_name,
                "secondLastName": name_object
                    .get("secondLastName")
                    .cloned()
                    .unwrap_or_else(|| json!("")),
            }),
        );
    }

    if let Some(email) = &customer.email {
        if contact.get("email").and_then(Value::as_str) != Some(email.as_str()) {
            updates.insert("email".into(), json!(email));
            updates.insert("emailSecondary".into(), json!(email));
        }
    }
    if let Some(phone) = &customer.phone {
        if contact.get("mobile").and_then(Value::as_str) != Some(phone.as_str()) {
            updates.insert("mobile".into(), json!(phone));
            updates.insert("phonePrimary".into(), json!(phone));
        }
    }

    if updates.is_empty() {
        return;
    }
    let Some(id) = contact_id(contact) else {
        return;
    };
    if let Err(err) = client.update_contact(&id, &Value::Object(updates)).await {
        tracing::warn!(contact_id = %id, error = %err, "unable to update contact");
    }
}

fn build_contact_payload(customer: &CustomerData, credential: &AccountingCredential) -> Value {
    let metadata = &credential.metadata;
    let (first_name, last_name) = split_name(&customer.name);

    let mut identification_number = customer
        .identification
        .clone()
        .or_else(|| customer.code.clone())
        .unwrap_or_default();
    if identification_number.is_empty() {
        identification_number = format!("AUTO-{}", first_name.to_uppercase());
    }

    let mut identification_kind = customer
        .identification_type
        .clone()
        .unwrap_or_else(|| meta_str(metadata, "default_identification_type", "CC"));
    if NUMERIC_IDENTIFICATION_TYPES.contains(&identification_kind.to_uppercase().as_str()) {
        identification_number = only_digits(&identification_number);
        if identification_number.is_empty() {
            // Digit-only normalization emptied the value; switch to a type
            // that accepts letters.
            identification_kind = meta_str(metadata, "generic_identification_type", "OTHER");
            identification_number = customer
                .code
                .clone()
                .unwrap_or_else(|| "AUTO-ID".to_string());
        }
    }

    let mut payload = json!({
        "nameObject": {
            "firstName": first_name,
            "lastName": last_name,
            "secondLastName": "",
        },
        "identificationObject": {
            "type": identification_kind,
            "number": identification_number,
        },
        "kindOfPerson": meta_str(metadata, "default_kind_of_person", "PERSON_ENTITY"),
        "regime": meta_str(metadata, "default_regime", "SIMPLIFIED_REGIME"),
        "type": "client",
    });

    if let Some(email) = &customer.email {
        payload["email"] = json!(email);
        payload["emailSecondary"] = json!(email);
    }
    if let Some(phone) = &customer.phone {
        payload["mobile"] = json!(phone);
        payload["phonePrimary"] = json!(phone);
    }
    let address = build_address_payload(&customer.address);
    if !address.is_null() {
        payload["address"] = address;
    }

    payload
}

fn build_address_payload(address: &Value) -> Value {
    if !address.is_object() {
        return Value::Null;
    }
    let get = |key: &str| address.get(key).and_then(Value::as_str).unwrap_or("");
    let line1 = if get("line1").is_empty() {
        get("name")
    } else {
        get("line1")
    };
    if line1.is_empty() && get("city").is_empty() {
        return Value::Null;
    }
    json!({
        "address": line1,
        "city": get("city"),
        "department": get("state"),
        "country": get("country"),
        "zipCode": get("postal_code"),
    })
}

/// Assemble the accounting invoice document from the source payload plus the
/// tenant's mapping metadata.
pub fn build_invoice_payload(
    payload: &Value,
    contact_id: &str,
    credential: &AccountingCredential,
) -> IntegrationResult<Value> {
    let metadata = &credential.metadata;

    let posting_date = payload
        .get("posting_date")
        .or_else(|| payload.get("date"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().date_naive().to_string());
    let due_date = payload
        .get("due_date")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| posting_date.clone());

    let grand_total = payload
        .get("grand_total")
        .or_else(|| payload.get("total"))
        .and_then(value_as_f64)
        .ok_or_else(|| {
            IntegrationError::Validation("the source payload does not include 'grand_total'".into())
        })?;

    let item_map = metadata.get("item_map").cloned().unwrap_or(Value::Null);
    let tax_map = metadata.get("tax_map").cloned().unwrap_or(Value::Null);

    // One tax per invoice: map the first source tax line through the tenant's
    // account-head table and attach it to every line.
    let invoice_tax = payload
        .get("taxes")
        .and_then(Value::as_array)
        .and_then(|taxes| taxes.first())
        .and_then(|tax| {
            let account_head = tax.get("account_head").and_then(Value::as_str)?;
            let tax_id = tax_map.get(account_head)?;
            Some(json!({
                "id": tax_id,
                "name": account_head,
                "percentage": tax.get("rate").and_then(value_as_f64).unwrap_or(0.0),
            }))
        });

    let mut items: Vec<Value> = Vec::new();
    let source_items: &[Value] = payload
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for item in source_items {
        let item_code = item
            .get("item_code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let accounting_item_id = item
            .get("accounting_item_id")
            .cloned()
            .filter(|v| !v.is_null())
            .or_else(|| item_map.get(&item_code).cloned());

        let mut line = json!({
            "name": item.get("item_name")
                .or_else(|| item.get("description"))
                .and_then(Value::as_str)
                .unwrap_or(&item_code),
            "description": item.get("description").and_then(Value::as_str).unwrap_or(""),
            "code": item_code,
            "reference": item_code,
            "quantity": item.get("qty").and_then(value_as_f64).unwrap_or(1.0),
            "price": item.get("rate")
                .and_then(value_as_f64)
                .or_else(|| item.get("amount").and_then(value_as_f64))
                .unwrap_or(0.0),
            "discount": item.get("discount").and_then(value_as_f64).unwrap_or(0.0),
        });
        if let Some(tax) = &invoice_tax {
            line["tax"] = tax.clone();
        }
        if let Some(id) = accounting_item_id {
            line["item"] = json!({ "id": maybe_int(&id) });
        }
        items.push(line);
    }

    let mut invoice = json!({
        "client": { "id": contact_id },
        "date": posting_date,
        "dueDate": due_date,
        "items": items,
        "stamp": { "generateStamp": credential.auto_stamp_on_create },
        "paymentForm": meta_str(metadata, "default_payment_form", "CASH"),
        "type": meta_str(metadata, "default_invoice_type", "NATIONAL"),
        "operationType": meta_str(metadata, "default_operation_type", "STANDARD"),
        "status": meta_str(metadata, "default_invoice_status", "open"),
    });

    let payments = build_payments(
        payload.get("payments").and_then(Value::as_array),
        metadata,
        grand_total,
        &due_date,
    );
    invoice["payments"] = json!(payments);

    let number_template_id = credential
        .number_template_id
        .map(|id| json!(id))
        .or_else(|| metadata.get("number_template_id").cloned());
    let mut number_template = Map::new();
    if let Some(id) = number_template_id {
        number_template.insert("id".into(), id);
    }
    if let Some(prefix) = metadata.get("number_template_prefix") {
        number_template.insert("prefix".into(), prefix.clone());
    }
    if let Some(number) = metadata.get("number_template_next") {
        number_template.insert("number".into(), number.clone());
    }
    if !number_template.is_empty() {
        invoice["numberTemplate"] = Value::Object(number_template);
    }

    if let Some(remarks) = payload.get("remarks").and_then(Value::as_str) {
        invoice["observations"] = json!(truncate_chars(remarks, 500));
    }

    if let Some(internal_id) = payload
        .get("naming_series")
        .or_else(|| payload.get("name"))
        .and_then(Value::as_str)
    {
        invoice["internalId"] = json!(internal_id);
    }

    let doctype = payload.get("doctype").and_then(Value::as_str);
    invoice["pointOfSale"] = json!(doctype == Some("POS Invoice"));

    Ok(invoice)
}

/// Payments: one entry per source payment mapped through the tenant's account
/// and method tables; with no source payments, a single synthesized payment
/// covers the full total at the default account.
fn build_payments(
    payments_payload: Option<&Vec<Value>>,
    metadata: &Value,
    total_amount: f64,
    due_date: &str,
) -> Vec<Value> {
    let account_map = metadata
        .get("payment_account_map")
        .cloned()
        .unwrap_or(Value::Null);
    let method_map = metadata
        .get("payment_method_map")
        .cloned()
        .unwrap_or(Value::Null);
    let default_account_id = metadata
        .get("default_payment_account_id")
        .map(value_to_plain_string)
        .unwrap_or_else(|| "1".to_string());
    let default_method = meta_str(metadata, "default_payment_method", "cash");

    let mut payments = Vec::new();
    if let Some(rows) = payments_payload {
        for payment in rows {
            let amount = payment.get("amount").and_then(value_as_f64).unwrap_or(0.0);
            if amount == 0.0 {
                continue;
            }
            let mode = payment
                .get("mode_of_payment")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("DEFAULT");
            let account_id = account_map
                .get(mode)
                .map(value_to_plain_string)
                .unwrap_or_else(|| default_account_id.clone());
            let method = method_map
                .get(mode)
                .and_then(Value::as_str)
                .unwrap_or(&default_method);
            payments.push(json!({
                "account": { "id": account_id },
                "date": due_date,
                "amount": amount,
                "paymentMethod": method,
            }));
        }
    }

    if payments.is_empty() {
        payments.push(json!({
            "account": { "id": default_account_id },
            "date": due_date,
            "amount": total_amount,
            "paymentMethod": default_method,
        }));
    }
    payments
}

fn split_name(full_name: &str) -> (String, String) {
    let trimmed = full_name.trim();
    if trimmed.is_empty() {
        return ("Customer".to_string(), String::new());
    }
    let mut parts = trimmed.split_whitespace();
    let first = parts.next().unwrap_or("Customer").to_string();
    let rest: Vec<&str> = parts.collect();
    (first, rest.join(" "))
}

fn only_digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn meta_str(metadata: &Value, key: &str, default: &str) -> String {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn maybe_int(value: &Value) -> Value {
    match value {
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => value.clone(),
        },
        other => other.clone(),
    }
}
