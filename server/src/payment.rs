use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{error::Error, mongo_ext::Collection};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    NetBanking,
    Upi,
    Cash,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRecordStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// A settlement attempt for a pickup. `transaction_id` is the gateway reference and is unique.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    pub pickup_id: ObjectId,

    pub amount: f64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub status: PaymentRecordStatus,
    pub transaction_id: String,
    pub payment_date: bson::DateTime,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl PaymentModel {
    pub fn new(
        user_id: ObjectId,
        pickup_id: ObjectId,
        amount: f64,
        payment_method: PaymentMethod,
        transaction_id: String,
        now: bson::DateTime,
    ) -> Result<Self, Error> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::InvalidInput(
                "Amount must be a non-negative number.".to_string(),
            ));
        }
        if transaction_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Transaction id is required.".to_string(),
            ));
        }

        Ok(Self {
            id: ObjectId::new(),
            user_id,
            pickup_id,
            amount,
            payment_method,
            status: PaymentRecordStatus::Pending,
            transaction_id,
            payment_date: now,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Clone)]
pub struct PaymentCollection(pub Collection<PaymentModel>);

impl std::ops::Deref for PaymentCollection {
    type Target = Collection<PaymentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PaymentCollection {
    pub async fn record(&self, payment: &PaymentModel) -> Result<(), Error> {
        if self
            .exists(bson::doc! { "transaction_id": &payment.transaction_id })
            .await?
        {
            return Err(Error::MustUniqueError("transaction id".to_string()));
        }

        self.insert_unique(payment, "transaction id").await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bson::oid::ObjectId;

    use crate::{api::v1::tests::bootstrap, error::Error};

    use super::*;

    fn payment(amount: f64, transaction_id: &str) -> Result<PaymentModel, Error> {
        PaymentModel::new(
            ObjectId::new(),
            ObjectId::new(),
            amount,
            PaymentMethod::Upi,
            transaction_id.to_string(),
            bson::DateTime::now(),
        )
    }

    #[test]
    fn test_new_payment() {
        let model = payment(50.0, "txn-1").unwrap();
        assert_eq!(model.status, PaymentRecordStatus::Pending);
        assert_eq!(model.payment_date, model.created_at);

        assert_matches!(payment(-1.0, "txn-2"), Err(Error::InvalidInput(_)));
        assert_matches!(payment(1.0, "  "), Err(Error::InvalidInput(_)));
        assert!(payment(0.0, "txn-3").is_ok());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            serde_json::to_string(&PaymentMethod::NetBanking).unwrap(),
            "\"net_banking\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::CreditCard).unwrap(),
            "\"credit_card\""
        );
    }

    #[tokio::test]
    async fn test_transaction_id_unique() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let payments = &bootstrap.app_state.payment_collection;

        payments.record(&payment(10.0, "txn-1").unwrap()).await.unwrap();

        let err = payments
            .record(&payment(20.0, "txn-1").unwrap())
            .await
            .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(_));

        let err = payments
            .insert_unique(&payment(30.0, "txn-1").unwrap(), "transaction id")
            .await
            .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(_));

        bootstrap.teardown().await;
    }
}
