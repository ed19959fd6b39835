use std::collections::HashSet;

use bson::oid::ObjectId;
use mongodb::{options::IndexOptions, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, error::Error, mongo_ext::Collection};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
    pub applied_at: bson::DateTime,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version(&self, version: i64) -> Result<(), Error> {
        self.insert_one(
            MigrateModel {
                id: ObjectId::new(),
                version,
                applied_at: bson::DateTime::now(),
            },
            None,
        )
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn applied(&self) -> Result<HashSet<i64>, Error> {
        Ok(self
            .find_all(bson::doc! {}, None)
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect())
    }
}

fn unique(keys: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn plain(keys: bson::Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

impl AppState {
    async fn v1_migrate(&self) -> Result<(), Error> {
        self.migrate_collection
            .create_index(unique(bson::doc! { "version": 1 }), None)
            .await?;

        self.user_collection
            .create_index(unique(bson::doc! { "email": 1 }), None)
            .await?;

        self.location_collection
            .create_index(unique(bson::doc! { "driver_id": 1 }), None)
            .await?;

        self.payment_collection
            .create_index(unique(bson::doc! { "transaction_id": 1 }), None)
            .await?;

        self.pickup_collection
            .create_index(plain(bson::doc! { "user_id": 1, "pickup_date": -1 }), None)
            .await?;

        self.pickup_collection
            .create_index(plain(bson::doc! { "assigned_driver_id": 1 }), None)
            .await?;

        Ok(())
    }

    /// Applies every migration that is not yet recorded. Index creation is idempotent, so a
    /// run interrupted before its version is recorded is simply repeated next start.
    pub async fn run_migration(&self) -> Result<(), Error> {
        let applied = self.migrate_collection.applied().await?;

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !applied.contains(&$version) {
                    tracing::info!("running migration version {}", $version);
                    self.$fun().await?;
                    self.migrate_collection.insert_version($version).await?;
                }
            };
        }

        migrate!(1, v1_migrate);

        Ok(())
    }
}
