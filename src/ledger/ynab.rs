//! YNAB client (Ledger A).

use super::http::{build_client, decode, status_error, transport_error};
use super::{is_pending_transaction, BudgetLedger, FetchBatch};
use crate::error::{Result, Service, SyncError};
use crate::profile::YnabSettings;
use crate::types::{BudgetTransaction, Checkpoint, Milliunits, NewBudgetTransaction};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const YNAB_API_URL: &str = "https://api.ynab.com/v1";

#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
struct TransactionsData {
    transactions: Vec<WireTransaction>,
    server_knowledge: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SaveTransactionData {
    #[serde(default)]
    transaction: Option<WireTransaction>,
    #[serde(default)]
    duplicate_import_ids: Vec<String>,
}

/// Transaction as YNAB sends it. Unknown flag colors are tolerated and read as unflagged.
#[derive(Debug, Clone, Deserialize)]
struct WireTransaction {
    id: String,
    date: NaiveDate,
    amount: Milliunits,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default)]
    payee_name: Option<String>,
    #[serde(default)]
    flag_color: Option<String>,
    account_id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    import_id: Option<String>,
}

impl From<WireTransaction> for BudgetTransaction {
    fn from(wire: WireTransaction) -> Self {
        BudgetTransaction {
            id: wire.id,
            date: wire.date,
            amount: wire.amount,
            memo: wire.memo,
            payee_name: wire.payee_name,
            flag_color: wire.flag_color.and_then(|color| color.parse().ok()),
            account_id: wire.account_id,
            deleted: wire.deleted,
            import_id: wire.import_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SaveTransaction<'a> {
    account_id: &'a str,
    date: NaiveDate,
    amount: Milliunits,
    payee_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<&'a str>,
    cleared: &'static str,
    approved: bool,
    import_id: &'a str,
}

/// YNAB payee names and memos are capped at 200 characters.
fn clip(value: &str) -> &str {
    match value.char_indices().nth(200) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Client for one user's budget.
#[derive(Debug, Clone)]
pub struct YnabClient {
    client: reqwest::Client,
    base_url: String,
    settings: YnabSettings,
}

impl YnabClient {
    pub fn new(settings: YnabSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: YNAB_API_URL.to_string(),
            settings,
        }
    }

    /// Point the client at another host (used against local stubs).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(Service::Ynab, timeout)?;
        Ok(self)
    }

    fn transactions_url(&self) -> String {
        format!(
            "{}/budgets/{}/transactions",
            self.base_url, self.settings.budget_id
        )
    }

    fn fetch_request(&self, checkpoint: Option<Checkpoint>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(self.transactions_url())
            .bearer_auth(&self.settings.api_key);
        if let Some(knowledge) = checkpoint.and_then(|c| c.server_knowledge()) {
            request = request.query(&[("last_knowledge_of_server", knowledge)]);
        }
        request
    }

    fn build_save<'a>(&'a self, draft: &'a NewBudgetTransaction) -> SaveTransaction<'a> {
        SaveTransaction {
            account_id: &self.settings.mirror_account_id,
            date: draft.date,
            amount: draft.amount,
            payee_name: clip(&draft.payee_name),
            memo: draft.memo.as_deref().map(clip),
            cleared: "cleared",
            approved: false,
            import_id: &draft.import_id,
        }
    }

    fn flag_body(&self) -> serde_json::Value {
        json!({
            "transaction": {
                "flag_color": self.settings.synced_flag.map(|color| color.as_str()),
            }
        })
    }

    /// Stand-in for a transaction YNAB refused to create twice.
    fn already_imported(&self, draft: &NewBudgetTransaction) -> BudgetTransaction {
        BudgetTransaction {
            id: draft.import_id.clone(),
            date: draft.date,
            amount: draft.amount,
            memo: draft.memo.clone(),
            payee_name: Some(draft.payee_name.clone()),
            flag_color: None,
            account_id: self.settings.mirror_account_id.clone(),
            deleted: false,
            import_id: Some(draft.import_id.clone()),
        }
    }

    fn pending_batch(&self, data: TransactionsData) -> FetchBatch<BudgetTransaction> {
        let records = data
            .transactions
            .into_iter()
            .map(BudgetTransaction::from)
            .filter(|txn| is_pending_transaction(txn, &self.settings))
            .collect();
        FetchBatch {
            records,
            checkpoint: Some(Checkpoint::ServerKnowledge(data.server_knowledge)),
        }
    }
}

#[async_trait]
impl BudgetLedger for YnabClient {
    async fn fetch_unprocessed(
        &self,
        checkpoint: Option<Checkpoint>,
    ) -> Result<FetchBatch<BudgetTransaction>> {
        let response = self
            .fetch_request(checkpoint)
            .send()
            .await
            .map_err(|e| transport_error(Service::Ynab, e))?;
        let envelope: Envelope<TransactionsData> = decode(Service::Ynab, response).await?;
        let total = envelope.data.transactions.len();
        let batch = self.pending_batch(envelope.data);
        debug!(
            "YNAB budget {}: {} changed transactions, {} pending",
            self.settings.budget_id,
            total,
            batch.records.len()
        );
        Ok(batch)
    }

    async fn create(&self, draft: &NewBudgetTransaction) -> Result<BudgetTransaction> {
        let response = self
            .client
            .post(self.transactions_url())
            .bearer_auth(&self.settings.api_key)
            .json(&json!({ "transaction": self.build_save(draft) }))
            .send()
            .await
            .map_err(|e| transport_error(Service::Ynab, e))?;

        if response.status() == StatusCode::CONFLICT {
            warn!(
                "YNAB reported a conflict for import id {}; treating it as already created",
                draft.import_id
            );
            return Ok(self.already_imported(draft));
        }

        let envelope: Envelope<SaveTransactionData> = decode(Service::Ynab, response).await?;
        match envelope.data.transaction {
            Some(created) => Ok(created.into()),
            None if envelope
                .data
                .duplicate_import_ids
                .iter()
                .any(|id| id == &draft.import_id) =>
            {
                debug!("YNAB already holds import id {}", draft.import_id);
                Ok(self.already_imported(draft))
            }
            None => Err(SyncError::rejected(
                Service::Ynab,
                None,
                "create returned no transaction",
            )),
        }
    }

    async fn mark_processed(&self, transaction: &BudgetTransaction) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/{}", self.transactions_url(), transaction.id))
            .bearer_auth(&self.settings.api_key)
            .json(&self.flag_body())
            .send()
            .await
            .map_err(|e| transport_error(Service::Ynab, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(Service::Ynab, status, &body));
        }
        Ok(())
    }
}
