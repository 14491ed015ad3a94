//! Splitwise client (Ledger B).

use super::http::{build_client, decode, transport_error};
use super::{is_unprocessed_expense, ExpenseLedger, FetchBatch};
use crate::error::{Result, Service, SyncError};
use crate::profile::SplitwiseSettings;
use crate::types::{Checkpoint, Comment, Expense, ExpenseUser, NewExpense, Share};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

const SPLITWISE_API_URL: &str = "https://secure.splitwise.com/api/v3.0";

#[derive(Debug, Clone, Deserialize)]
struct ExpensesResponse {
    #[serde(default)]
    expenses: Vec<WireExpense>,
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<WireComment>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponse {
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct WireComment {
    id: i64,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUser {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireShare {
    user_id: i64,
    #[serde(default = "zero")]
    paid_share: String,
    #[serde(default = "zero")]
    owed_share: String,
    #[serde(default = "zero")]
    net_balance: String,
}

fn zero() -> String {
    "0.00".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct WireExpense {
    id: i64,
    date: DateTime<Utc>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: Option<String>,
    cost: String,
    #[serde(default)]
    currency_code: String,
    #[serde(default)]
    users: Vec<WireShare>,
    #[serde(default)]
    created_by: Option<WireUser>,
    #[serde(default)]
    deleted_at: Option<String>,
    #[serde(default)]
    comments_count: u32,
}

impl WireExpense {
    fn into_expense(self, comments: Vec<Comment>) -> Expense {
        let created_by = self
            .created_by
            .map(|user| ExpenseUser {
                id: user.id,
                first_name: user.first_name,
            })
            .unwrap_or(ExpenseUser {
                id: 0,
                first_name: None,
            });
        Expense {
            id: self.id,
            date: self.date,
            description: self.description,
            details: self.details.filter(|d| !d.trim().is_empty()),
            cost: self.cost,
            currency_code: self.currency_code,
            users: self
                .users
                .into_iter()
                .map(|share| Share {
                    user_id: share.user_id,
                    paid_share: share.paid_share,
                    owed_share: share.owed_share,
                    net_balance: share.net_balance,
                })
                .collect(),
            created_by,
            deleted: self.deleted_at.is_some(),
            comments,
        }
    }
}

/// Splitwise reports validation problems in an `errors` field that is `{}`, `[]`,
/// or a map of field names to message lists.
fn error_messages(errors: &Value) -> Option<String> {
    let mut messages = Vec::new();
    collect_messages(errors, &mut messages);
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

fn collect_messages(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_messages(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_messages(item, out)),
        _ => {}
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Client for one user's shared group.
#[derive(Debug, Clone)]
pub struct SplitwiseClient {
    client: reqwest::Client,
    base_url: String,
    settings: SplitwiseSettings,
}

impl SplitwiseClient {
    pub fn new(settings: SplitwiseSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: SPLITWISE_API_URL.to_string(),
            settings,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(Service::Splitwise, timeout)?;
        Ok(self)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn expenses_request(&self, checkpoint: Option<Checkpoint>) -> reqwest::RequestBuilder {
        let mut query = vec![
            ("group_id", self.settings.group_id.to_string()),
            ("limit", "0".to_string()),
        ];
        if let Some(since) = checkpoint.and_then(|c| c.since()) {
            query.push(("dated_after", format_date(since)));
        }
        self.client
            .get(self.url("get_expenses"))
            .bearer_auth(&self.settings.api_key)
            .query(&query)
    }

    /// Flattened `users__N__field` body Splitwise expects for a custom split.
    fn create_body(&self, draft: &NewExpense) -> Result<Value> {
        let (user_share, partner_share) = self.settings.split_ratio.split_cost(&draft.cost)?;
        let mut body = Map::new();
        body.insert("cost".into(), json!(draft.cost));
        body.insert("description".into(), json!(draft.description));
        if let Some(details) = draft.details.as_deref().filter(|d| !d.is_empty()) {
            body.insert("details".into(), json!(details));
        }
        body.insert("date".into(), json!(format_date(draft.date)));
        body.insert("group_id".into(), json!(self.settings.group_id));
        body.insert("currency_code".into(), json!(self.settings.currency_code));
        let parties = [
            (self.settings.user_id, draft.cost.as_str(), user_share.as_str()),
            (self.settings.partner_id, "0.00", partner_share.as_str()),
        ];
        for (idx, (user_id, paid, owed)) in parties.iter().enumerate() {
            body.insert(format!("users__{idx}__user_id"), json!(user_id));
            body.insert(format!("users__{idx}__paid_share"), json!(paid));
            body.insert(format!("users__{idx}__owed_share"), json!(owed));
        }
        Ok(Value::Object(body))
    }

    async fn comments_for(&self, expense_id: i64) -> Result<Vec<Comment>> {
        let response = self
            .client
            .get(self.url("get_comments"))
            .bearer_auth(&self.settings.api_key)
            .query(&[("expense_id", expense_id)])
            .send()
            .await
            .map_err(|e| transport_error(Service::Splitwise, e))?;
        let body: CommentsResponse = decode(Service::Splitwise, response).await?;
        Ok(body
            .comments
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                content: c.content,
            })
            .collect())
    }

    fn unprocessed_batch(
        &self,
        expenses: Vec<Expense>,
        checkpoint: Option<Checkpoint>,
    ) -> FetchBatch<Expense> {
        let records: Vec<Expense> = expenses
            .into_iter()
            .filter(|expense| is_unprocessed_expense(expense, &self.settings))
            .collect();
        let checkpoint = records
            .iter()
            .map(|expense| expense.date)
            .max()
            .map(Checkpoint::Since)
            .or(checkpoint);
        FetchBatch { records, checkpoint }
    }
}

#[async_trait]
impl ExpenseLedger for SplitwiseClient {
    async fn fetch_unprocessed(&self, checkpoint: Option<Checkpoint>) -> Result<FetchBatch<Expense>> {
        let response = self
            .expenses_request(checkpoint)
            .send()
            .await
            .map_err(|e| transport_error(Service::Splitwise, e))?;
        let body: ExpensesResponse = decode(Service::Splitwise, response).await?;

        let mut expenses = Vec::with_capacity(body.expenses.len());
        for wire in body.expenses {
            let comments = if wire.comments_count > 0 && wire.deleted_at.is_none() {
                self.comments_for(wire.id).await?
            } else {
                Vec::new()
            };
            expenses.push(wire.into_expense(comments));
        }

        let total = expenses.len();
        let batch = self.unprocessed_batch(expenses, checkpoint);
        debug!(
            "Splitwise group {}: {} expenses, {} unprocessed",
            self.settings.group_id,
            total,
            batch.records.len()
        );
        Ok(batch)
    }

    async fn create(&self, draft: &NewExpense) -> Result<Expense> {
        let body = self.create_body(draft)?;
        let response = self
            .client
            .post(self.url("create_expense"))
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Service::Splitwise, e))?;
        let status = response.status().as_u16();
        let body: ExpensesResponse = decode(Service::Splitwise, response).await?;
        if let Some(message) = error_messages(&body.errors) {
            return Err(SyncError::rejected(Service::Splitwise, Some(status), message));
        }
        body.expenses
            .into_iter()
            .next()
            .map(|wire| wire.into_expense(Vec::new()))
            .ok_or_else(|| {
                SyncError::rejected(Service::Splitwise, Some(status), "create returned no expense")
            })
    }

    async fn mark_processed(&self, expense: &Expense) -> Result<()> {
        let response = self
            .client
            .post(self.url("create_comment"))
            .bearer_auth(&self.settings.api_key)
            .json(&json!({
                "expense_id": expense.id,
                "content": self.settings.marker,
            }))
            .send()
            .await
            .map_err(|e| transport_error(Service::Splitwise, e))?;
        let status = response.status().as_u16();
        let body: CommentResponse = decode(Service::Splitwise, response).await?;
        match error_messages(&body.errors) {
            Some(message) => Err(SyncError::rejected(Service::Splitwise, Some(status), message)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::splitwise_settings;
    use chrono::TimeZone;

    fn client() -> SplitwiseClient {
        SplitwiseClient::new(splitwise_settings()).with_base_url("http://localhost:9998/api/v3.0")
    }

    #[test]
    fn expenses_request_uses_group_and_checkpoint() {
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let request = client()
            .expenses_request(Some(Checkpoint::Since(since)))
            .build()
            .unwrap();
        assert_eq!(request.url().path(), "/api/v3.0/get_expenses");
        let query = request.url().query().unwrap();
        assert!(query.contains("group_id=300"));
        assert!(query.contains("limit=0"));
        assert!(query.contains("dated_after=2024-03-01T12%3A00%3A00Z"));
    }

    #[test]
    fn create_body_makes_user_sole_payer_with_split() {
        let draft = NewExpense {
            date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            description: "Grocer".into(),
            details: Some("weekly shop".into()),
            cost: "150.00".into(),
        };
        let body = client().create_body(&draft).unwrap();
        assert_eq!(body["cost"], "150.00");
        assert_eq!(body["group_id"], 300);
        assert_eq!(body["currency_code"], "USD");
        assert_eq!(body["date"], "2024-03-01T00:00:00Z");
        assert_eq!(body["users__0__user_id"], 100);
        assert_eq!(body["users__0__paid_share"], "150.00");
        assert_eq!(body["users__0__owed_share"], "75.00");
        assert_eq!(body["users__1__user_id"], 200);
        assert_eq!(body["users__1__paid_share"], "0.00");
        assert_eq!(body["users__1__owed_share"], "75.00");
    }

    #[test]
    fn wire_expense_parses_and_filters() {
        let body = json!({
            "expenses": [
                {"id": 1, "date": "2024-03-02T10:00:00Z", "description": "Dinner",
                 "details": "", "cost": "75.0", "currency_code": "USD",
                 "created_by": {"id": 200, "first_name": "Sam"},
                 "users": [
                     {"user_id": 200, "paid_share": "75.0", "owed_share": "37.5", "net_balance": "37.5"},
                     {"user_id": 100, "paid_share": "0.0", "owed_share": "37.5", "net_balance": "-37.5"}
                 ],
                 "deleted_at": null, "comments_count": 0},
                {"id": 2, "date": "2024-03-03T10:00:00Z", "description": "Old",
                 "cost": "10.0", "currency_code": "USD",
                 "created_by": {"id": 200, "first_name": "Sam"}, "users": [],
                 "deleted_at": "2024-03-04T00:00:00Z"}
            ],
            "errors": {}
        });
        let parsed: ExpensesResponse = serde_json::from_value(body).unwrap();
        assert_eq!(error_messages(&parsed.errors), None);
        let expenses: Vec<Expense> = parsed
            .expenses
            .into_iter()
            .map(|wire| wire.into_expense(Vec::new()))
            .collect();
        assert_eq!(expenses[0].details, None);
        assert!(expenses[1].deleted);

        let batch = client().unprocessed_batch(expenses, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].created_by.first_name.as_deref(), Some("Sam"));
        assert_eq!(
            batch.checkpoint,
            Some(Checkpoint::Since(Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap()))
        );
    }

    #[test]
    fn empty_batch_keeps_previous_checkpoint() {
        let since = Checkpoint::Since(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let batch = client().unprocessed_batch(Vec::new(), Some(since));
        assert_eq!(batch.checkpoint, Some(since));
    }

    #[test]
    fn error_payloads_are_flattened() {
        assert_eq!(error_messages(&json!({})), None);
        assert_eq!(error_messages(&json!([])), None);
        assert_eq!(error_messages(&Value::Null), None);
        assert_eq!(
            error_messages(&json!({"base": ["Invalid cost", "Unknown user"]})).as_deref(),
            Some("Invalid cost; Unknown user")
        );
    }
}
