use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    AdPayment,
    PublisherEarning,
    Deposit,
    Withdrawal,
    Fee,
    Refund,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdPayment => "ad_payment",
            Self::PublisherEarning => "publisher_earning",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Fee => "fee",
            Self::Refund => "refund",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ad_payment" => Some(Self::AdPayment),
            "publisher_earning" => Some(Self::PublisherEarning),
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "fee" => Some(Self::Fee),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Credits must be positive and debits negative.
    pub fn is_credit(self) -> bool {
        matches!(self, Self::Deposit | Self::PublisherEarning | Self::Refund)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    pub account_id: String,
    pub balance_sats: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry. Replaying every entry for an account yields its cached balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub transaction_id: String,
    pub account_id: String,
    pub kind: TransactionType,
    pub amount_sats: i64,
    pub balance_after_sats: i64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LedgerDelta {
    pub account_id: String,
    pub amount_sats: i64,
    pub kind: TransactionType,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerDelta {
    pub fn new(
        account_id: impl Into<String>,
        amount_sats: i64,
        kind: TransactionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            amount_sats,
            kind,
            description: description.into(),
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDelta {
    pub transaction_id: String,
    pub new_balance_sats: i64,
    /// True when the idempotency key had already been applied and nothing changed.
    pub replayed: bool,
}
