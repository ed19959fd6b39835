use std::ops::Deref;

use bson::{oid::ObjectId, Document};
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::FindOptions,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

const DUPLICATE_KEY: i32 = 11000;

/// Whether `err` was raised by a unique index rejecting the write.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(err)) => err.code == DUPLICATE_KEY,
        ErrorKind::Command(err) => err.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Maps a unique index violation to [`Error::MustUniqueError`] naming `field`.
pub fn unique_violation(err: mongodb::error::Error, field: &str) -> Error {
    if is_duplicate_key(&err) {
        tracing::debug!("unique index rejected {}", field);
        Error::MustUniqueError(field.to_string())
    } else {
        err.into()
    }
}

pub struct Collection<T>(pub mongodb::Collection<T>);

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Collection<T> {
    type Target = mongodb::Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<mongodb::Collection<T>> for Collection<T> {
    fn from(value: mongodb::Collection<T>) -> Self {
        Self(value)
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned + Serialize + Send + Sync + Unpin,
{
    pub async fn find_one_by_id(&self, id: ObjectId) -> Result<Option<T>, Error> {
        self.find_one(bson::doc! { "_id": id }, None)
            .await
            .map_err(Into::into)
    }

    /// Runs `filter` and drains the cursor, optionally ordered by `sort`.
    pub async fn find_all(
        &self,
        filter: Document,
        sort: impl Into<Option<Document>>,
    ) -> Result<Vec<T>, Error> {
        let sort: Option<Document> = sort.into();
        let options = FindOptions::builder().sort(sort).build();
        let mut cursor = self.find(filter, options).await?;

        let mut result = vec![];

        while cursor.advance().await? {
            result.push(cursor.deserialize_current()?);
        }

        Ok(result)
    }

    /// Inserts `model`, reporting a unique index hit on `field` as a client error.
    pub async fn insert_unique(&self, model: &T, field: &str) -> Result<(), Error> {
        self.insert_one(model, None)
            .await
            .map(|_| ())
            .map_err(|err| unique_violation(err, field))
    }

    pub async fn exists(&self, filter: Document) -> Result<bool, Error> {
        self.count_documents(filter, None)
            .await
            .map(|count| count > 0)
            .map_err(Into::into)
    }
}
