use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::RuntimeDb;
use crate::ledger::types::{AccountRow, AppliedDelta, LedgerDelta, TransactionRow, TransactionType};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("insufficient funds: balance {balance_sats} sats cannot cover {requested_sats} sats")]
    InsufficientFunds {
        balance_sats: i64,
        requested_sats: i64,
    },
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Durable per-account balances plus the append-only transaction log behind them.
///
/// `apply_delta` is the only way balances change. Implementations append the transaction
/// row and update the cached balance as one atomic read-modify-write, so concurrent debits
/// against one account never both pass a balance that covers only one of them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens the account with a zero balance, or returns it unchanged if it exists.
    async fn open_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError>;

    async fn get_account(&self, account_id: &str) -> Result<AccountRow, LedgerStoreError>;

    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AppliedDelta, LedgerStoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, LedgerStoreError>;

    async fn get_balance(&self, account_id: &str) -> Result<i64, LedgerStoreError> {
        Ok(self.get_account(account_id).await?.balance_sats)
    }
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

pub(crate) fn validate_delta(delta: &LedgerDelta) -> Result<(), LedgerStoreError> {
    if delta.account_id.trim().is_empty() {
        return Err(LedgerStoreError::InvalidDelta(
            "account_id is required".to_string(),
        ));
    }
    if delta.amount_sats == 0 {
        return Err(LedgerStoreError::InvalidDelta(
            "amount_sats must be non-zero".to_string(),
        ));
    }
    if delta.kind.is_credit() != (delta.amount_sats > 0) {
        return Err(LedgerStoreError::InvalidDelta(format!(
            "{} amount has the wrong sign: {}",
            delta.kind.as_str(),
            delta.amount_sats
        )));
    }
    Ok(())
}

fn delta_fingerprint_sha256(delta: &LedgerDelta) -> String {
    let mut hasher = Sha256::new();
    hasher.update(delta.account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(delta.amount_sats.to_be_bytes());
    hasher.update(b"|");
    hasher.update(delta.kind.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

fn next_balance(balance_sats: i64, amount_sats: i64) -> Result<i64, LedgerStoreError> {
    let insufficient = || LedgerStoreError::InsufficientFunds {
        balance_sats,
        requested_sats: amount_sats.saturating_neg(),
    };
    let next = balance_sats.checked_add(amount_sats).ok_or_else(insufficient)?;
    if next < 0 {
        return Err(insufficient());
    }
    Ok(next)
}

fn new_transaction_id() -> String {
    format!("txn_{}", Uuid::now_v7().simple())
}

#[derive(Default)]
struct MemoryLedgerStore {
    inner: Mutex<MemoryLedgerStoreInner>,
}

#[derive(Default)]
struct MemoryLedgerStoreInner {
    accounts: HashMap<String, AccountRow>,
    transactions: Vec<TransactionRow>,
    by_idempotency_key: HashMap<String, (usize, String)>,
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn open_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        if account_id.trim().is_empty() {
            return Err(LedgerStoreError::InvalidDelta(
                "account_id is required".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountRow {
                account_id: account_id.to_string(),
                balance_sats: 0,
                created_at: now,
                updated_at: now,
            });
        Ok(account.clone())
    }

    async fn get_account(&self, account_id: &str) -> Result<AccountRow, LedgerStoreError> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AppliedDelta, LedgerStoreError> {
        validate_delta(&delta)?;
        let fingerprint = delta_fingerprint_sha256(&delta);
        let mut inner = self.inner.lock().await;

        if let Some(key) = delta.idempotency_key.as_deref() {
            if let Some((index, existing_fingerprint)) = inner.by_idempotency_key.get(key) {
                if *existing_fingerprint != fingerprint {
                    return Err(LedgerStoreError::Conflict(
                        "idempotency_key reused with different delta parameters".to_string(),
                    ));
                }
                let existing = inner
                    .transactions
                    .get(*index)
                    .ok_or_else(|| LedgerStoreError::Db("missing transaction row".to_string()))?;
                return Ok(AppliedDelta {
                    transaction_id: existing.transaction_id.clone(),
                    new_balance_sats: existing.balance_after_sats,
                    replayed: true,
                });
            }
        }

        let account = inner
            .accounts
            .get_mut(&delta.account_id)
            .ok_or_else(|| LedgerStoreError::AccountNotFound(delta.account_id.clone()))?;
        let new_balance_sats = next_balance(account.balance_sats, delta.amount_sats)?;
        account.balance_sats = new_balance_sats;
        account.updated_at = delta.created_at;

        let transaction_id = new_transaction_id();
        inner.transactions.push(TransactionRow {
            transaction_id: transaction_id.clone(),
            account_id: delta.account_id,
            kind: delta.kind,
            amount_sats: delta.amount_sats,
            balance_after_sats: new_balance_sats,
            description: delta.description,
            idempotency_key: delta.idempotency_key.clone(),
            created_at: delta.created_at,
        });
        if let Some(key) = delta.idempotency_key {
            let index = inner.transactions.len() - 1;
            inner.by_idempotency_key.insert(key, (index, fingerprint));
        }

        Ok(AppliedDelta {
            transaction_id,
            new_balance_sats,
            replayed: false,
        })
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        if !inner.accounts.contains_key(account_id) {
            return Err(LedgerStoreError::AccountNotFound(account_id.to_string()));
        }
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|row| row.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

struct PostgresLedgerStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn open_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        if account_id.trim().is_empty() {
            return Err(LedgerStoreError::InvalidDelta(
                "account_id is required".to_string(),
            ));
        }
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO runtime.ledger_accounts (account_id, balance_sats, created_at, updated_at)
                VALUES ($1, 0, $2, $2)
                ON CONFLICT (account_id) DO NOTHING
                "#,
                &[&account_id, &now],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_one(
                r#"
                SELECT account_id, balance_sats, created_at, updated_at
                  FROM runtime.ledger_accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        map_account_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn get_account(&self, account_id: &str) -> Result<AccountRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT account_id, balance_sats, created_at, updated_at
                  FROM runtime.ledger_accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(LedgerStoreError::AccountNotFound(account_id.to_string()));
        };
        map_account_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AppliedDelta, LedgerStoreError> {
        validate_delta(&delta)?;
        let fingerprint = delta_fingerprint_sha256(&delta);
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        // The account row lock serializes every delta for this account, including
        // concurrent replays of the same idempotency key.
        let account = tx
            .query_opt(
                r#"
                SELECT balance_sats
                  FROM runtime.ledger_accounts
                 WHERE account_id = $1
                 FOR UPDATE
                "#,
                &[&delta.account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let Some(account) = account else {
            return Err(LedgerStoreError::AccountNotFound(delta.account_id.clone()));
        };
        let balance_sats: i64 = account
            .try_get("balance_sats")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        if let Some(key) = delta.idempotency_key.as_deref() {
            let existing = tx
                .query_opt(
                    r#"
                    SELECT transaction_id, balance_after_sats, request_fingerprint_sha256
                      FROM runtime.ledger_transactions
                     WHERE idempotency_key = $1
                    "#,
                    &[&key],
                )
                .await
                .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
            if let Some(row) = existing {
                let existing_fingerprint: String = row.get("request_fingerprint_sha256");
                if existing_fingerprint != fingerprint {
                    return Err(LedgerStoreError::Conflict(
                        "idempotency_key reused with different delta parameters".to_string(),
                    ));
                }
                let out = AppliedDelta {
                    transaction_id: row.get("transaction_id"),
                    new_balance_sats: row.get("balance_after_sats"),
                    replayed: true,
                };
                tx.commit()
                    .await
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
                return Ok(out);
            }
        }

        let new_balance_sats = next_balance(balance_sats, delta.amount_sats)?;
        let transaction_id = new_transaction_id();

        tx.execute(
            r#"
            INSERT INTO runtime.ledger_transactions (
                transaction_id, account_id, kind, amount_sats, balance_after_sats,
                description, idempotency_key, request_fingerprint_sha256, created_at
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9
            )
            "#,
            &[
                &transaction_id,
                &delta.account_id,
                &delta.kind.as_str(),
                &delta.amount_sats,
                &new_balance_sats,
                &delta.description,
                &delta.idempotency_key,
                &fingerprint,
                &delta.created_at,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            UPDATE runtime.ledger_accounts
               SET balance_sats = $2,
                   updated_at = $3
             WHERE account_id = $1
            "#,
            &[&delta.account_id, &new_balance_sats, &delta.created_at],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        Ok(AppliedDelta {
            transaction_id,
            new_balance_sats,
            replayed: false,
        })
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRow>, LedgerStoreError> {
        // Surfaces AccountNotFound rather than an empty history.
        self.get_account(account_id).await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT transaction_id, account_id, kind, amount_sats, balance_after_sats,
                       description, idempotency_key, created_at
                  FROM runtime.ledger_transactions
                 WHERE account_id = $1
                 ORDER BY created_at DESC, transaction_id DESC
                 LIMIT $2
                "#,
                &[&account_id, &limit],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_transaction_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }
}

fn map_account_row(row: &tokio_postgres::Row) -> Result<AccountRow, String> {
    Ok(AccountRow {
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        balance_sats: row.try_get("balance_sats").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_transaction_row(row: &tokio_postgres::Row) -> Result<TransactionRow, String> {
    let kind: String = row.try_get("kind").map_err(|e| e.to_string())?;
    Ok(TransactionRow {
        transaction_id: row
            .try_get("transaction_id")
            .map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        kind: TransactionType::parse(&kind)
            .ok_or_else(|| format!("unknown transaction kind: {kind}"))?,
        amount_sats: row.try_get("amount_sats").map_err(|e| e.to_string())?,
        balance_after_sats: row
            .try_get("balance_after_sats")
            .map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        idempotency_key: row
            .try_get("idempotency_key")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}
