use std::collections::HashMap;

use axum::{extract::State, Json};
use bson::{oid::ObjectId, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    util::{Coordinates, FormattedDateTime, ObjectIdString, PathObjectId, Payload, QueryParams},
};

use super::auth::{MessageResponse, UserAccess, UserCollection, UserModel, UserRole};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Available,
    OnRoute,
    OnPickup,
    #[default]
    Offline,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::OnRoute => "on_route",
            Self::OnPickup => "on_pickup",
            Self::Offline => "offline",
        }
    }
}

/// Last reported position of a driver. There is at most one per driver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DriverLocationModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub driver_id: ObjectId,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub status: DriverStatus,
    pub timestamp: bson::DateTime,
}

#[derive(Clone)]
pub struct DriverLocationCollection(pub Collection<DriverLocationModel>);

impl std::ops::Deref for DriverLocationCollection {
    type Target = Collection<DriverLocationModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DriverSummary {
    pub id: ObjectIdString,
    pub name: String,
    pub email: String,
}

impl From<&UserModel> for DriverSummary {
    fn from(value: &UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name.clone(),
            email: value.email.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocation {
    pub id: ObjectIdString,
    pub driver_id: ObjectIdString,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverSummary>,
    pub coordinates: Coordinates,
    pub status: DriverStatus,
    pub timestamp: FormattedDateTime,
}

impl DriverLocation {
    fn new(model: DriverLocationModel, driver: Option<DriverSummary>) -> Self {
        Self {
            id: model.id.into(),
            driver_id: model.driver_id.into(),
            driver,
            coordinates: model.coordinates,
            status: model.status,
            timestamp: model.timestamp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LocationRequest {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub status: Option<DriverStatus>,
}

impl LocationRequest {
    pub fn coordinates(&self) -> Result<Coordinates, Error> {
        let (Some(lat), Some(lng)) = (self.lat, self.lng) else {
            return Err(Error::InvalidInput(
                "Latitude and longitude are required and must be numbers.".to_string(),
            ));
        };

        let coordinates = Coordinates { lat, lng };
        coordinates.validate()?;

        Ok(coordinates)
    }
}

/// Update document for the location upsert. A report without a status marks the driver available.
pub fn location_update(
    coordinates: Coordinates,
    status: Option<DriverStatus>,
    now: bson::DateTime,
) -> Document {
    bson::doc! {
        "$set": {
            "coordinates": { "lat": coordinates.lat, "lng": coordinates.lng },
            "status": status.unwrap_or(DriverStatus::Available).as_str(),
            "timestamp": now,
        }
    }
}

pub fn available_filter(status: Option<DriverStatus>) -> Document {
    match status {
        Some(status) => bson::doc! { "status": status.as_str() },
        None => bson::doc! { "status": { "$ne": DriverStatus::Offline.as_str() } },
    }
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn update_location(
    State(locations): State<DriverLocationCollection>,
    user: UserAccess,
    Payload(request): Payload<LocationRequest>,
) -> Result<Json<DriverLocation>, Error> {
    let user = user.allow(&[UserRole::Driver])?;
    let coordinates = request
        .coordinates()
        .tap_err(|err| tracing::debug!("rejected location report: {}", err))?;

    let options = FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::After)
        .build();

    let model = locations
        .find_one_and_update(
            bson::doc! { "driver_id": user.id },
            location_update(coordinates, request.status, bson::DateTime::now()),
            options,
        )
        .await?
        .ok_or(Error::EntityNotFound("Driver location"))?;

    Ok(Json(DriverLocation::new(model, None)))
}

#[tracing::instrument(skip_all, fields(driver = %driver_id))]
pub async fn show(
    State(locations): State<DriverLocationCollection>,
    State(users): State<UserCollection>,
    _user: UserAccess,
    PathObjectId(driver_id): PathObjectId,
) -> Result<Json<DriverLocation>, Error> {
    let model = locations
        .find_one(bson::doc! { "driver_id": driver_id }, None)
        .await?
        .ok_or(Error::EntityNotFound("Driver location"))?;

    let driver = users
        .find_one_by_id(driver_id)
        .await?
        .as_ref()
        .map(DriverSummary::from);

    Ok(Json(DriverLocation::new(model, driver)))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AvailableQuery {
    pub status: Option<DriverStatus>,
}

pub async fn available(
    State(locations): State<DriverLocationCollection>,
    State(users): State<UserCollection>,
    _user: UserAccess,
    QueryParams(query): QueryParams<AvailableQuery>,
) -> Result<Json<Vec<DriverLocation>>, Error> {
    let models = locations
        .find_all(available_filter(query.status), bson::doc! { "timestamp": -1 })
        .await?;

    let ids: Vec<ObjectId> = models.iter().map(|it| it.driver_id).collect();
    let drivers: HashMap<ObjectId, DriverSummary> = users
        .find_all(bson::doc! { "_id": { "$in": ids } }, None)
        .await?
        .iter()
        .map(|it| (it.id, DriverSummary::from(it)))
        .collect();

    Ok(Json(
        models
            .into_iter()
            .map(|it| {
                let driver = drivers.get(&it.driver_id).cloned();
                DriverLocation::new(it, driver)
            })
            .collect(),
    ))
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn remove_location(
    State(locations): State<DriverLocationCollection>,
    user: UserAccess,
) -> Result<Json<MessageResponse>, Error> {
    let user = user.allow(&[UserRole::Driver])?;

    locations
        .find_one_and_delete(bson::doc! { "driver_id": user.id }, None)
        .await?
        .ok_or(Error::EntityNotFound("Driver location"))?;

    Ok(Json(MessageResponse {
        message: "Driver location removed.".to_string(),
    }))
}
