//! JSON-RPC adapter for the remote ledger (`/jsonrpc`, `execute_kw` style).
//!
//! Maps HTTP and RPC failures onto `RemoteError`:
//!
//! | Response | RemoteError |
//! |----------|-------------|
//! | HTTP 429 | `Throttled` |
//! | HTTP 5xx | `Server` |
//! | other non-2xx, undecodable body, missing `result` | `Protocol` |
//! | connect/timeout/IO | `Transport` |
//! | RPC error named `*AccessDenied*` / failed login | `Auth` |
//! | any other RPC error | `Fault` |

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use remitsync_reconciliation::IdempotencyKey;
use remitsync_remote::{LedgerApi, MatchMode, PartyRecord, ReceiptDraft, ReceiptRef, RemoteError};

use crate::config::RemoteSettings;

/// Party fields searched for an identifier. The last one is the tax id of
/// the backing commercial entity.
const IDENTITY_FIELDS: [&str; 3] = ["vat", "ref", "commercial_partner_id.vat"];

pub struct JsonRpcLedger {
    client: reqwest::Client,
    endpoint: String,
    database: String,
    username: String,
    password: String,
    idempotency_field: String,
    uid: RwLock<Option<i64>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for JsonRpcLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcLedger")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

impl JsonRpcLedger {
    pub fn new(settings: &RemoteSettings) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/jsonrpc", settings.url.trim_end_matches('/')),
            database: settings.database.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            idempotency_field: settings.idempotency_field.clone(),
            uid: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn uid(&self) -> Result<i64, RemoteError> {
        self.uid
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .ok_or_else(|| RemoteError::Auth("session not authenticated".to_string()))
    }

    async fn rpc(&self, service: &str, method: &str, args: Value) -> Result<Value, RemoteError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::Throttled);
        }
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Server {
                status: status.as_u16(),
                message: truncate(&message),
            });
        }
        if !status.is_success() {
            return Err(RemoteError::Protocol(format!("unexpected http status {status}")));
        }

        let envelope: RpcResponse = response.json().await.map_err(map_reqwest_error)?;
        if let Some(err) = envelope.error {
            return Err(classify_rpc_error(err));
        }
        envelope
            .result
            .ok_or_else(|| RemoteError::Protocol("response carries neither result nor error".to_string()))
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, RemoteError> {
        let uid = self.uid()?;
        self.rpc(
            "object",
            "execute_kw",
            json!([self.database, uid, self.password, model, method, args, kwargs]),
        )
        .await
    }
}

#[async_trait]
impl LedgerApi for JsonRpcLedger {
    #[instrument(skip(self), fields(database = %self.database), err)]
    async fn authenticate(&self) -> Result<i64, RemoteError> {
        let result = self
            .rpc(
                "common",
                "login",
                json!([self.database, self.username, self.password]),
            )
            .await?;
        let uid = result
            .as_i64()
            .filter(|uid| *uid > 0)
            .ok_or_else(|| RemoteError::Auth(format!("login refused for {}", self.username)))?;
        *self.uid.write().unwrap_or_else(|p| p.into_inner()) = Some(uid);
        Ok(uid)
    }

    #[instrument(skip(self), err)]
    async fn journal_scope(&self, journal_id: i64) -> Result<i64, RemoteError> {
        let rows = self
            .execute_kw(
                "account.journal",
                "read",
                json!([[journal_id], ["company_id"]]),
                json!({}),
            )
            .await?;
        as_array(&rows)?
            .first()
            .and_then(|row| many2one_id(row.get("company_id")))
            .ok_or_else(|| RemoteError::NotFound(format!("journal {journal_id}")))
    }

    #[instrument(skip(self), err)]
    async fn list_scopes(&self) -> Result<Vec<i64>, RemoteError> {
        let ids = self
            .execute_kw("res.company", "search", json!([[]]), json!({}))
            .await?;
        Ok(as_array(&ids)?.iter().filter_map(Value::as_i64).collect())
    }

    #[instrument(skip(self, variants), fields(variants = variants.len()), err)]
    async fn search_parties(
        &self,
        variants: &[String],
        mode: MatchMode,
        scopes: &[i64],
    ) -> Result<Vec<PartyRecord>, RemoteError> {
        if variants.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .execute_kw(
                "res.partner",
                "search_read",
                json!([identity_domain(variants, mode)]),
                json!({
                    "fields": ["name", "company_id", "vat", "ref", "commercial_partner_id"],
                    "context": scope_context(scopes),
                }),
            )
            .await?;
        let rows = as_array(&rows)?;

        let mut parties = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| RemoteError::Protocol("party row without id".to_string()))?;
            let identity_values: Vec<String> = [text(row.get("vat")), text(row.get("ref"))]
                .into_iter()
                .flatten()
                .collect();
            parties.push(PartyRecord {
                id,
                name: text(row.get("name")).unwrap_or_default(),
                scope_id: many2one_id(row.get("company_id")),
                identity_values,
                backing_id: many2one_id(row.get("commercial_partner_id")).filter(|b| *b != id),
            });
        }
        Ok(parties)
    }

    #[instrument(skip(self, entity_ids), fields(entities = entity_ids.len()), err)]
    async fn backing_identities(
        &self,
        entity_ids: &[i64],
        scopes: &[i64],
    ) -> Result<Vec<(i64, String)>, RemoteError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .execute_kw(
                "res.partner",
                "read",
                json!([entity_ids, ["vat"]]),
                json!({ "context": scope_context(scopes) }),
            )
            .await?;
        Ok(as_array(&rows)?
            .iter()
            .filter_map(|row| Some((row.get("id")?.as_i64()?, text(row.get("vat"))?)))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn receivable_debt(&self, party_id: i64, scope_id: i64) -> Result<f64, RemoteError> {
        let rows = self
            .execute_kw(
                "account.move.line",
                "search_read",
                json!([[
                    ["partner_id", "=", party_id],
                    ["account_id.account_type", "=", "asset_receivable"],
                    ["reconciled", "=", false],
                    ["parent_state", "=", "posted"],
                    ["company_id", "=", scope_id],
                ]]),
                json!({
                    "fields": ["amount_residual"],
                    "context": scope_context(&[scope_id]),
                }),
            )
            .await?;
        Ok(as_array(&rows)?
            .iter()
            .filter_map(|row| row.get("amount_residual").and_then(Value::as_f64))
            .sum())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn find_receipt(
        &self,
        key: &IdempotencyKey,
        scope_id: i64,
    ) -> Result<Option<ReceiptRef>, RemoteError> {
        let rows = self
            .execute_kw(
                "account.payment",
                "search_read",
                json!([[[self.idempotency_field, "=", key.as_str()], ["company_id", "=", scope_id]]]),
                json!({
                    "fields": ["state"],
                    "limit": 1,
                    "order": "id asc",
                    "context": scope_context(&[scope_id]),
                }),
            )
            .await?;
        Ok(as_array(&rows)?.first().and_then(|row| {
            Some(ReceiptRef {
                id: row.get("id")?.as_i64()?,
                state: text(row.get("state")).unwrap_or_else(|| "draft".to_string()),
            })
        }))
    }

    #[instrument(skip(self, draft), fields(party_id = draft.party_id, amount = draft.amount), err)]
    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<i64, RemoteError> {
        let mut vals = json!({
            "payment_type": "inbound",
            "partner_type": "customer",
            "partner_id": draft.party_id,
            "amount": draft.amount,
            "date": draft.date.format("%Y-%m-%d").to_string(),
            "journal_id": draft.journal_id,
            "company_id": draft.scope_id,
            "memo": draft.memo,
        });
        vals[self.idempotency_field.as_str()] = json!(draft.idempotency_key.as_str());
        if let Some(pm) = draft.payment_method_line_id {
            vals["payment_method_line_id"] = json!(pm);
        }

        let created = self
            .execute_kw(
                "account.payment",
                "create",
                json!([vals]),
                json!({ "context": scope_context(&[draft.scope_id]) }),
            )
            .await?;
        // Newer servers answer batch creates with a list of ids.
        created
            .as_i64()
            .or_else(|| created.as_array()?.first()?.as_i64())
            .ok_or_else(|| RemoteError::Protocol(format!("unexpected create result: {created}")))
    }

    #[instrument(skip(self), err)]
    async fn finalize_receipt(&self, receipt_id: i64, scope_id: i64) -> Result<(), RemoteError> {
        self.execute_kw(
            "account.payment",
            "action_post",
            json!([[receipt_id]]),
            json!({ "context": scope_context(&[scope_id]) }),
        )
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn receipt_state(&self, receipt_id: i64, scope_id: i64) -> Result<String, RemoteError> {
        let rows = self
            .execute_kw(
                "account.payment",
                "read",
                json!([[receipt_id], ["state"]]),
                json!({ "context": scope_context(&[scope_id]) }),
            )
            .await?;
        as_array(&rows)?
            .first()
            .map(|row| text(row.get("state")).unwrap_or_else(|| "draft".to_string()))
            .ok_or_else(|| RemoteError::NotFound(format!("receipt {receipt_id}")))
    }
}

/// Prefix-notation disjunction over every identity field and variant.
fn identity_domain(variants: &[String], mode: MatchMode) -> Value {
    let op = match mode {
        MatchMode::Exact => "=",
        MatchMode::Partial => "ilike",
    };
    let clauses: Vec<Value> = variants
        .iter()
        .flat_map(|v| IDENTITY_FIELDS.iter().map(move |field| json!([field, op, v])))
        .collect();
    let mut domain: Vec<Value> = std::iter::repeat_n(json!("|"), clauses.len().saturating_sub(1)).collect();
    domain.extend(clauses);
    Value::Array(domain)
}

fn scope_context(scopes: &[i64]) -> Value {
    json!({ "allowed_company_ids": scopes })
}

/// Id of a many2one value (`[id, "name"]`, a bare id, or `false`).
fn many2one_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Array(pair) => pair.first()?.as_i64(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Non-blank string field (`false` stands for "unset").
fn text(value: Option<&Value>) -> Option<String> {
    value?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn as_array(value: &Value) -> Result<&Vec<Value>, RemoteError> {
    value
        .as_array()
        .ok_or_else(|| RemoteError::Protocol(format!("expected a list, got {value}")))
}

fn classify_rpc_error(err: RpcError) -> RemoteError {
    let data = err.data.unwrap_or_default();
    let detail = if data.message.is_empty() {
        err.message
    } else {
        format!("{}: {}", err.message, data.message)
    };
    if data.name.contains("AccessDenied") {
        RemoteError::Auth(truncate(&detail))
    } else {
        RemoteError::Fault(truncate(&detail))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Protocol(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

fn truncate(message: &str) -> String {
    remitsync_reconciliation::outcome::truncate(message)
}
