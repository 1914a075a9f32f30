//! Typed registry of queues, job types and their payloads.
//!
//! Every `(queue, job type)` pair the platform knows about is a variant of
//! [`JobKind`]; dispatch goes through [`JobType`] rather than string lookup.

use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Logical queues, one per functional area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueName {
    Publication,
    User,
    Migration,
    Payout,
    PayTo,
    PayToByBlockchain,
    Appreciation,
    TxTimeout,
    Revision,
    Asset,
    Stripe,
    Circle,
    Ipfs,
    ExchangeRate,
}

impl QueueName {
    pub const ALL: [QueueName; 14] = [
        QueueName::Publication,
        QueueName::User,
        QueueName::Migration,
        QueueName::Payout,
        QueueName::PayTo,
        QueueName::PayToByBlockchain,
        QueueName::Appreciation,
        QueueName::TxTimeout,
        QueueName::Revision,
        QueueName::Asset,
        QueueName::Stripe,
        QueueName::Circle,
        QueueName::Ipfs,
        QueueName::ExchangeRate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Publication => "publication",
            QueueName::User => "user",
            QueueName::Migration => "migration",
            QueueName::Payout => "payout",
            QueueName::PayTo => "payTo",
            QueueName::PayToByBlockchain => "payToByBlockchain",
            QueueName::Appreciation => "appreciation",
            QueueName::TxTimeout => "txTimeout",
            QueueName::Revision => "revision",
            QueueName::Asset => "asset",
            QueueName::Stripe => "stripe",
            QueueName::Circle => "circle",
            QueueName::Ipfs => "ipfs",
            QueueName::ExchangeRate => "exchangeRate",
        }
    }

    /// Job types routed to this queue.
    pub fn job_types(self) -> impl Iterator<Item = JobType> {
        JobType::ALL.into_iter().filter(move |t| t.queue() == self)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

/// Handler-selecting discriminator within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    PublishArticle,
    PublishPendingDrafts,
    #[serde(rename = "verifyIPFSPinHashes")]
    VerifyIpfsPinHashes,
    #[serde(rename = "refreshIPNSFeed")]
    RefreshIpnsFeed,
    ActivateOnboardingUsers,
    UnbanUsers,
    Migration,
    Payout,
    PayTo,
    PayToByBlockchain,
    SyncCurationEvents,
    TxTimeout,
    Appreciation,
    PublishRevisedArticle,
    PublishPendingRevisionDrafts,
    DeleteAsset,
    SyncDeliveryFailedEvents,
    TransferTrialEndSubscriptions,
    UpdateFiat,
    UpdateToken,
}

impl JobType {
    pub const ALL: [JobType; 20] = [
        JobType::PublishArticle,
        JobType::PublishPendingDrafts,
        JobType::VerifyIpfsPinHashes,
        JobType::RefreshIpnsFeed,
        JobType::ActivateOnboardingUsers,
        JobType::UnbanUsers,
        JobType::Migration,
        JobType::Payout,
        JobType::PayTo,
        JobType::PayToByBlockchain,
        JobType::SyncCurationEvents,
        JobType::TxTimeout,
        JobType::Appreciation,
        JobType::PublishRevisedArticle,
        JobType::PublishPendingRevisionDrafts,
        JobType::DeleteAsset,
        JobType::SyncDeliveryFailedEvents,
        JobType::TransferTrialEndSubscriptions,
        JobType::UpdateFiat,
        JobType::UpdateToken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::PublishArticle => "publishArticle",
            JobType::PublishPendingDrafts => "publishPendingDrafts",
            JobType::VerifyIpfsPinHashes => "verifyIPFSPinHashes",
            JobType::RefreshIpnsFeed => "refreshIPNSFeed",
            JobType::ActivateOnboardingUsers => "activateOnboardingUsers",
            JobType::UnbanUsers => "unbanUsers",
            JobType::Migration => "migration",
            JobType::Payout => "payout",
            JobType::PayTo => "payTo",
            JobType::PayToByBlockchain => "payToByBlockchain",
            JobType::SyncCurationEvents => "syncCurationEvents",
            JobType::TxTimeout => "txTimeout",
            JobType::Appreciation => "appreciation",
            JobType::PublishRevisedArticle => "publishRevisedArticle",
            JobType::PublishPendingRevisionDrafts => "publishPendingRevisionDrafts",
            JobType::DeleteAsset => "deleteAsset",
            JobType::SyncDeliveryFailedEvents => "syncDeliveryFailedEvents",
            JobType::TransferTrialEndSubscriptions => "transferTrialEndSubscriptions",
            JobType::UpdateFiat => "updateFiat",
            JobType::UpdateToken => "updateToken",
        }
    }

    /// The queue that owns this job type.
    pub fn queue(self) -> QueueName {
        match self {
            JobType::PublishArticle
            | JobType::PublishPendingDrafts
            | JobType::VerifyIpfsPinHashes => QueueName::Publication,
            JobType::RefreshIpnsFeed => QueueName::Ipfs,
            JobType::ActivateOnboardingUsers | JobType::UnbanUsers => QueueName::User,
            JobType::Migration => QueueName::Migration,
            JobType::Payout => QueueName::Payout,
            JobType::PayTo => QueueName::PayTo,
            JobType::PayToByBlockchain | JobType::SyncCurationEvents => {
                QueueName::PayToByBlockchain
            }
            JobType::TxTimeout => QueueName::TxTimeout,
            JobType::Appreciation => QueueName::Appreciation,
            JobType::PublishRevisedArticle | JobType::PublishPendingRevisionDrafts => {
                QueueName::Revision
            }
            JobType::DeleteAsset => QueueName::Asset,
            JobType::SyncDeliveryFailedEvents => QueueName::Stripe,
            JobType::TransferTrialEndSubscriptions => QueueName::Circle,
            JobType::UpdateFiat | JobType::UpdateToken => QueueName::ExchangeRate,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type: {}", s))
    }
}

/// A job's typed payload. The variant is the job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobKind {
    #[serde(rename = "publishArticle", rename_all = "camelCase")]
    PublishArticle { draft_id: String },
    #[serde(rename = "publishPendingDrafts")]
    PublishPendingDrafts {},
    #[serde(rename = "verifyIPFSPinHashes")]
    VerifyIpfsPinHashes {},
    #[serde(rename = "refreshIPNSFeed", rename_all = "camelCase")]
    RefreshIpnsFeed { user_name: String, num_articles: u32 },
    #[serde(rename = "activateOnboardingUsers")]
    ActivateOnboardingUsers {},
    #[serde(rename = "unbanUsers")]
    UnbanUsers {},
    #[serde(rename = "migration", rename_all = "camelCase")]
    Migration {
        migration_type: String,
        user_id: String,
        htmls: Vec<String>,
    },
    #[serde(rename = "payout", rename_all = "camelCase")]
    Payout { tx_id: String },
    #[serde(rename = "payTo", rename_all = "camelCase")]
    PayTo { tx_id: String },
    #[serde(rename = "payToByBlockchain", rename_all = "camelCase")]
    PayToByBlockchain { tx_id: String },
    #[serde(rename = "syncCurationEvents")]
    SyncCurationEvents {},
    #[serde(rename = "txTimeout", rename_all = "camelCase")]
    TxTimeout { tx_id: String },
    #[serde(rename = "appreciation", rename_all = "camelCase")]
    Appreciation {
        sender_id: String,
        recipient_id: String,
        article_id: String,
        amount: u32,
    },
    #[serde(rename = "publishRevisedArticle", rename_all = "camelCase")]
    PublishRevisedArticle { draft_id: String },
    #[serde(rename = "publishPendingRevisionDrafts")]
    PublishPendingRevisionDrafts {},
    #[serde(rename = "deleteAsset", rename_all = "camelCase")]
    DeleteAsset { asset_id: String, path: String },
    #[serde(rename = "syncDeliveryFailedEvents")]
    SyncDeliveryFailedEvents {},
    #[serde(rename = "transferTrialEndSubscriptions")]
    TransferTrialEndSubscriptions {},
    #[serde(rename = "updateFiat")]
    UpdateFiat {},
    #[serde(rename = "updateToken")]
    UpdateToken {},
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::PublishArticle { .. } => JobType::PublishArticle,
            JobKind::PublishPendingDrafts {} => JobType::PublishPendingDrafts,
            JobKind::VerifyIpfsPinHashes {} => JobType::VerifyIpfsPinHashes,
            JobKind::RefreshIpnsFeed { .. } => JobType::RefreshIpnsFeed,
            JobKind::ActivateOnboardingUsers {} => JobType::ActivateOnboardingUsers,
            JobKind::UnbanUsers {} => JobType::UnbanUsers,
            JobKind::Migration { .. } => JobType::Migration,
            JobKind::Payout { .. } => JobType::Payout,
            JobKind::PayTo { .. } => JobType::PayTo,
            JobKind::PayToByBlockchain { .. } => JobType::PayToByBlockchain,
            JobKind::SyncCurationEvents {} => JobType::SyncCurationEvents,
            JobKind::TxTimeout { .. } => JobType::TxTimeout,
            JobKind::Appreciation { .. } => JobType::Appreciation,
            JobKind::PublishRevisedArticle { .. } => JobType::PublishRevisedArticle,
            JobKind::PublishPendingRevisionDrafts {} => JobType::PublishPendingRevisionDrafts,
            JobKind::DeleteAsset { .. } => JobType::DeleteAsset,
            JobKind::SyncDeliveryFailedEvents {} => JobType::SyncDeliveryFailedEvents,
            JobKind::TransferTrialEndSubscriptions {} => JobType::TransferTrialEndSubscriptions,
            JobKind::UpdateFiat {} => JobType::UpdateFiat,
            JobKind::UpdateToken {} => JobType::UpdateToken,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.job_type().queue()
    }

    /// Split into `(job type, payload)` for storage.
    pub fn to_parts(&self) -> Result<(JobType, serde_json::Value), serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        Ok((self.job_type(), payload))
    }

    /// Rebuild from a stored `(job type, payload)` pair.
    pub fn from_parts(
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": job_type.as_str(),
            "payload": payload,
        }))
    }

    /// Synchronous producer-side validation.
    pub fn validate(&self) -> Result<(), QueueError> {
        fn require(field: &str, value: &str) -> Result<(), QueueError> {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidPayload(format!("{} must not be empty", field)));
            }
            Ok(())
        }

        match self {
            JobKind::PublishArticle { draft_id } | JobKind::PublishRevisedArticle { draft_id } => {
                require("draft_id", draft_id)
            }
            JobKind::RefreshIpnsFeed {
                user_name,
                num_articles,
            } => {
                require("user_name", user_name)?;
                if *num_articles == 0 {
                    return Err(QueueError::InvalidPayload(
                        "num_articles must be positive".into(),
                    ));
                }
                Ok(())
            }
            JobKind::Migration {
                migration_type,
                user_id,
                htmls,
            } => {
                require("migration_type", migration_type)?;
                require("user_id", user_id)?;
                if htmls.is_empty() {
                    return Err(QueueError::InvalidPayload(
                        "migration content must not be empty".into(),
                    ));
                }
                Ok(())
            }
            JobKind::Payout { tx_id }
            | JobKind::PayTo { tx_id }
            | JobKind::PayToByBlockchain { tx_id }
            | JobKind::TxTimeout { tx_id } => require("tx_id", tx_id),
            JobKind::Appreciation {
                sender_id,
                recipient_id,
                article_id,
                amount,
            } => {
                require("sender_id", sender_id)?;
                require("recipient_id", recipient_id)?;
                require("article_id", article_id)?;
                if *amount == 0 {
                    return Err(QueueError::InvalidPayload("amount must be positive".into()));
                }
                Ok(())
            }
            JobKind::DeleteAsset { asset_id, path } => {
                require("asset_id", asset_id)?;
                require("path", path)
            }
            JobKind::PublishPendingDrafts {}
            | JobKind::VerifyIpfsPinHashes {}
            | JobKind::ActivateOnboardingUsers {}
            | JobKind::UnbanUsers {}
            | JobKind::SyncCurationEvents {}
            | JobKind::PublishPendingRevisionDrafts {}
            | JobKind::SyncDeliveryFailedEvents {}
            | JobKind::TransferTrialEndSubscriptions {}
            | JobKind::UpdateFiat {}
            | JobKind::UpdateToken {} => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_job_type_round_trips_its_name() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>(), Ok(job_type));
            let json = serde_json::to_value(job_type).unwrap();
            assert_eq!(json, serde_json::json!(job_type.as_str()));
        }
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>(), Ok(queue));
        }
    }

    #[test]
    fn every_queue_has_a_job_type() {
        for queue in QueueName::ALL {
            assert!(queue.job_types().next().is_some(), "{} has no job types", queue);
        }
    }

    #[test]
    fn parts_rebuild_the_kind() {
        let kind = JobKind::Migration {
            migration_type: "medium".into(),
            user_id: "42".into(),
            htmls: vec!["<p>hi</p>".into()],
        };
        let (job_type, payload) = kind.to_parts().unwrap();
        assert_eq!(job_type, JobType::Migration);
        assert_eq!(payload["userId"], "42");
        assert_eq!(JobKind::from_parts(job_type, payload).unwrap(), kind);

        let sweep = JobKind::UnbanUsers {};
        let (job_type, payload) = sweep.to_parts().unwrap();
        assert_eq!(payload, serde_json::json!({}));
        assert_eq!(JobKind::from_parts(job_type, payload).unwrap(), sweep);
    }

    #[test]
    fn validation_rejects_empty_identifiers() {
        let bad = JobKind::PublishArticle {
            draft_id: " ".into(),
        };
        assert!(matches!(bad.validate(), Err(QueueError::InvalidPayload(_))));

        let empty_migration = JobKind::Migration {
            migration_type: "medium".into(),
            user_id: "1".into(),
            htmls: vec![],
        };
        assert!(empty_migration.validate().is_err());

        assert!(JobKind::TxTimeout { tx_id: "9".into() }.validate().is_ok());
        assert!(JobKind::UpdateFiat {}.validate().is_ok());
    }

    #[test]
    fn kind_maps_to_owning_queue() {
        assert_eq!(
            JobKind::PayToByBlockchain { tx_id: "1".into() }.queue(),
            QueueName::PayToByBlockchain
        );
        assert_eq!(JobType::RefreshIpnsFeed.queue(), QueueName::Ipfs);
    }
}
