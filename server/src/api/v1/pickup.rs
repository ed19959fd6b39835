use axum::{extract::State, http::StatusCode, Json};
use bson::{oid::ObjectId, Document};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    util::{
        parse_date, Coordinates, FormattedDateTime, ObjectIdString, PathObjectId, Payload,
        QueryParams,
    },
};

use super::auth::{UserAccess, UserCollection, UserRole};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PickupStatus {
    #[default]
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl PickupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancellable(&self) -> bool {
        match self {
            Self::Pending | Self::Scheduled => true,
            Self::InProgress | Self::Completed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for PickupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of waste we collect. Values we do not know yet are kept as `other`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WasteType {
    Recyclable,
    Hazardous,
    Organic,
    Electronic,
    General,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Refunded,
    Failed,
}

#[derive(Serialize, Deserialize, Validate, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub street: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

impl Address {
    fn check(&self) -> Result<(), Error> {
        self.validate()?;
        if let Some(coordinates) = &self.coordinates {
            coordinates.validate()?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PickupModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,

    pub pickup_date: bson::DateTime,
    pub status: PickupStatus,
    pub waste_type: WasteType,
    pub quantity: f64,
    pub pickup_address: Address,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default)]
    pub assigned_driver_id: Option<ObjectId>,
    /// Older clients read the driver from here; kept equal to `assigned_driver_id`.
    #[serde(default)]
    pub driver: Option<ObjectId>,

    pub price: f64,
    #[serde(default)]
    pub payment_status: PaymentStatus,

    #[serde(default)]
    pub started_at: Option<bson::DateTime>,
    #[serde(default)]
    pub completed_at: Option<bson::DateTime>,
    #[serde(default)]
    pub cancelled_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct PickupCollection(pub Collection<PickupModel>);

impl std::ops::Deref for PickupCollection {
    type Target = Collection<PickupModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PickupCollection {
    /// Replaces the stored pickup unless another write landed after it was read at `read_at`.
    pub async fn save(&self, model: &PickupModel, read_at: bson::DateTime) -> Result<(), Error> {
        let result = self
            .replace_one(
                bson::doc! { "_id": model.id, "updated_at": read_at },
                model,
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(Error::Conflict("Pickup"))
                .tap_err(|_| tracing::debug!("pickup {} changed since it was read", model.id));
        }

        Ok(())
    }
}

/// Placeholder pricing: a flat rate per unit of quantity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricingPolicy {
    pub unit_rate: f64,
}

impl PricingPolicy {
    /// Fails when the product overflows, so a stored price is always a finite number.
    pub fn price_for(&self, quantity: f64) -> Result<f64, Error> {
        let price = self.unit_rate * quantity;

        if price.is_finite() {
            Ok(price)
        } else {
            Err(Error::InvalidInput("Quantity is too large.".to_string()))
        }
    }
}

fn positive_quantity(quantity: f64) -> Result<f64, Error> {
    if quantity.is_finite() && quantity > 0.0 {
        Ok(quantity)
    } else {
        Err(Error::InvalidInput(
            "Quantity must be a positive number.".to_string(),
        ))
    }
}

fn pickup_date(value: &str) -> Result<bson::DateTime, Error> {
    parse_date(value)
        .map(Into::into)
        .ok_or_else(|| Error::InvalidInput("Invalid date format for pickupDate.".to_string()))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub pickup_date: Option<String>,
    pub waste_type: Option<WasteType>,
    pub quantity: Option<f64>,
    pub pickup_address: Option<Address>,
    #[serde(default)]
    pub images: Vec<String>,
    pub special_instructions: Option<String>,
    pub notes: Option<String>,
}

impl PickupModel {
    /// Builds a new `pending` pickup for `user_id`, priced by `pricing`.
    pub fn new(
        user_id: ObjectId,
        request: CreateRequest,
        pricing: &PricingPolicy,
        now: bson::DateTime,
    ) -> Result<Self, Error> {
        let (Some(date), Some(waste_type), Some(quantity), Some(address)) = (
            request.pickup_date,
            request.waste_type,
            request.quantity,
            request.pickup_address,
        ) else {
            return Err(Error::InvalidInput("Missing required fields.".to_string()));
        };

        let pickup_date = pickup_date(&date)?;
        let quantity = positive_quantity(quantity)?;
        let price = pricing.price_for(quantity)?;
        address.check()?;

        Ok(Self {
            id: ObjectId::new(),
            user_id,
            pickup_date,
            status: PickupStatus::Pending,
            waste_type,
            quantity,
            pickup_address: address,
            images: request.images,
            special_instructions: request.special_instructions,
            notes: request.notes,
            assigned_driver_id: None,
            driver: None,
            price,
            payment_status: PaymentStatus::Pending,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// `assigned_driver_id` wins; a pickup that only has the legacy `driver` set adopts it.
    pub fn sync_driver_reference(&mut self) {
        match (self.assigned_driver_id, self.driver) {
            (Some(id), _) => self.driver = Some(id),
            (None, Some(id)) => self.assigned_driver_id = Some(id),
            (None, None) => {}
        }
    }

    fn touch(&mut self, now: bson::DateTime) {
        self.updated_at = now;
        self.sync_driver_reference();
    }

    /// Reassigning a pickup in any state is allowed.
    pub fn assign(&mut self, driver_id: ObjectId, now: bson::DateTime) {
        self.assigned_driver_id = Some(driver_id);
        self.status = PickupStatus::Scheduled;
        self.touch(now);
    }

    pub fn start(&mut self, now: bson::DateTime) {
        self.status = PickupStatus::InProgress;
        self.started_at = Some(now);
        self.touch(now);
    }

    /// Settlement is mocked, so completing a pickup also marks it paid.
    pub fn complete(&mut self, now: bson::DateTime) {
        self.status = PickupStatus::Completed;
        self.completed_at = Some(now);
        self.payment_status = PaymentStatus::Paid;
        self.touch(now);
    }

    pub fn cancel(&mut self, now: bson::DateTime) -> Result<(), Error> {
        if !self.status.is_cancellable() {
            return Err(Error::InvalidTransition {
                action: "cancel",
                status: self.status,
            });
        }

        self.status = PickupStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.touch(now);

        Ok(())
    }

    /// Administrative override. Fields are validated, but status changes skip every transition
    /// guard and no lifecycle timestamp is stamped.
    pub fn apply(&mut self, patch: UpdateRequest, now: bson::DateTime) -> Result<(), Error> {
        let pickup_date = patch.pickup_date.as_deref().map(pickup_date).transpose()?;
        let quantity = patch.quantity.map(positive_quantity).transpose()?;
        let driver_id = patch.driver_reference();
        if let Some(address) = &patch.pickup_address {
            address.check()?;
        }
        if let Some(price) = patch.price {
            if !price.is_finite() || price < 0.0 {
                return Err(Error::InvalidInput(
                    "Price must be a non-negative number.".to_string(),
                ));
            }
        }

        if let Some(pickup_date) = pickup_date {
            self.pickup_date = pickup_date;
        }
        if let Some(quantity) = quantity {
            self.quantity = quantity;
        }
        if let Some(address) = patch.pickup_address {
            self.pickup_address = address;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(waste_type) = patch.waste_type {
            self.waste_type = waste_type;
        }
        if let Some(images) = patch.images {
            self.images = images;
        }
        if let Some(special_instructions) = patch.special_instructions {
            self.special_instructions = Some(special_instructions);
        }
        if let Some(notes) = patch.notes {
            self.notes = Some(notes);
        }
        if let Some(price) = patch.price {
            self.price = price;
        }
        if let Some(payment_status) = patch.payment_status {
            self.payment_status = payment_status;
        }
        if let Some(driver_id) = driver_id {
            self.assigned_driver_id = Some(driver_id);
            self.driver = Some(driver_id);
        }

        self.touch(now);

        Ok(())
    }
}

/// Which pickups a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickupScope {
    All,
    OwnedBy(ObjectId),
    AssignedTo(ObjectId),
}

fn driver_references(driver_id: ObjectId) -> bson::Bson {
    bson::bson!([
        { "assigned_driver_id": driver_id },
        { "driver": driver_id },
    ])
}

impl PickupScope {
    pub fn of(user: &UserAccess) -> Self {
        match user.role {
            UserRole::Admin => Self::All,
            UserRole::User => Self::OwnedBy(user.id),
            UserRole::Driver => Self::AssignedTo(user.id),
        }
    }

    pub fn filter(&self) -> Document {
        match self {
            Self::All => Document::new(),
            Self::OwnedBy(user_id) => bson::doc! { "user_id": user_id },
            Self::AssignedTo(driver_id) => bson::doc! { "$or": driver_references(*driver_id) },
        }
    }

    pub fn permits(&self, pickup: &PickupModel) -> bool {
        match self {
            Self::All => true,
            Self::OwnedBy(user_id) => pickup.user_id == *user_id,
            Self::AssignedTo(driver_id) => {
                pickup.assigned_driver_id == Some(*driver_id) || pickup.driver == Some(*driver_id)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PickupQuery {
    pub status: Option<PickupStatus>,
    pub waste_type: Option<WasteType>,
    pub user_id: Option<ObjectIdString>,
    pub driver_id: Option<ObjectIdString>,
}

/// Combines the caller's scope with the optional query filters. Status and waste type only ever
/// narrow a scope; owner and driver filters are honoured for unrestricted callers only.
pub fn list_filter(scope: PickupScope, query: &PickupQuery) -> Result<Document, Error> {
    let mut filter = scope.filter();

    if let Some(status) = query.status {
        filter.insert("status", bson::to_bson(&status)?);
    }
    if let Some(waste_type) = query.waste_type {
        filter.insert("waste_type", bson::to_bson(&waste_type)?);
    }

    match scope {
        PickupScope::All => {
            if let Some(user_id) = query.user_id {
                filter.insert("user_id", user_id.0);
            }
            if let Some(driver_id) = query.driver_id {
                filter.insert("$or", driver_references(driver_id.0));
            }
        }
        PickupScope::OwnedBy(..) | PickupScope::AssignedTo(..) => {}
    }

    Ok(filter)
}

async fn find_scoped(
    pickups: &PickupCollection,
    scope: PickupScope,
    id: ObjectId,
) -> Result<PickupModel, Error> {
    let mut filter = scope.filter();
    filter.insert("_id", id);

    pickups
        .find_one(filter, None)
        .await?
        .filter(|it| scope.permits(it))
        .ok_or(Error::EntityNotFound("Pickup"))
        .tap_err(|_| tracing::debug!("pickup {} not visible in {:?}", id, scope))
}

async fn ensure_driver(users: &UserCollection, driver_id: ObjectId) -> Result<(), Error> {
    let role = bson::to_bson(&UserRole::Driver)?;

    if users
        .exists(bson::doc! { "_id": driver_id, "role": role })
        .await?
    {
        Ok(())
    } else {
        Err(Error::InvalidInput(
            "driverId does not reference a driver.".to_string(),
        ))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pickup {
    pub id: ObjectIdString,
    pub user_id: ObjectIdString,

    pub pickup_date: FormattedDateTime,
    pub status: PickupStatus,
    pub waste_type: WasteType,
    pub quantity: f64,
    pub pickup_address: Address,
    pub images: Vec<String>,
    pub special_instructions: Option<String>,
    pub notes: Option<String>,

    pub assigned_driver_id: Option<ObjectIdString>,
    pub driver: Option<ObjectIdString>,

    pub price: f64,
    pub payment_status: PaymentStatus,

    pub started_at: Option<FormattedDateTime>,
    pub completed_at: Option<FormattedDateTime>,
    pub cancelled_at: Option<FormattedDateTime>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<PickupModel> for Pickup {
    fn from(mut value: PickupModel) -> Self {
        value.sync_driver_reference();

        Self {
            id: value.id.into(),
            user_id: value.user_id.into(),

            pickup_date: value.pickup_date.into(),
            status: value.status,
            waste_type: value.waste_type,
            quantity: value.quantity,
            pickup_address: value.pickup_address,
            images: value.images,
            special_instructions: value.special_instructions,
            notes: value.notes,

            assigned_driver_id: value.assigned_driver_id.map(Into::into),
            driver: value.driver.map(Into::into),

            price: value.price,
            payment_status: value.payment_status,

            started_at: value.started_at.map(Into::into),
            completed_at: value.completed_at.map(Into::into),
            cancelled_at: value.cancelled_at.map(Into::into),

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

fn newest_first() -> Document {
    bson::doc! { "pickup_date": -1, "created_at": -1 }
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(pickups): State<PickupCollection>,
    State(pricing): State<PricingPolicy>,
    user: UserAccess,
    Payload(request): Payload<CreateRequest>,
) -> Result<(StatusCode, Json<Pickup>), Error> {
    let user = user.allow(&[UserRole::User])?;

    let model = PickupModel::new(user.id, request, &pricing, bson::DateTime::now())
        .tap_err(|err| tracing::debug!("rejected pickup request: {}", err))?;

    tracing::debug!("creating pickup {}", model.id);
    pickups.insert_one(&model, None).await?;

    Ok((StatusCode::CREATED, Json(model.into())))
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn index(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    QueryParams(query): QueryParams<PickupQuery>,
) -> Result<Json<Vec<Pickup>>, Error> {
    let filter = list_filter(PickupScope::of(&user), &query)?;
    let models = pickups.find_all(filter, newest_first()).await?;

    Ok(Json(models.into_iter().map(Into::into).collect()))
}

/// Pickups the caller requested, whatever their role.
#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn mine(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    QueryParams(query): QueryParams<PickupQuery>,
) -> Result<Json<Vec<Pickup>>, Error> {
    let filter = list_filter(PickupScope::OwnedBy(user.id), &query)?;
    let models = pickups.find_all(filter, newest_first()).await?;

    Ok(Json(models.into_iter().map(Into::into).collect()))
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn show(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<Pickup>, Error> {
    let model = find_scoped(&pickups, PickupScope::of(&user), id).await?;

    Ok(Json(model.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub quantity: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EstimateResponse {
    pub quantity: f64,
    pub unit_rate: f64,
    pub price: f64,
}

pub async fn estimate(
    State(pricing): State<PricingPolicy>,
    _user: UserAccess,
    Payload(request): Payload<EstimateRequest>,
) -> Result<Json<EstimateResponse>, Error> {
    let quantity = request
        .quantity
        .ok_or_else(|| Error::InvalidInput("Missing required fields.".to_string()))
        .and_then(positive_quantity)?;
    let price = pricing.price_for(quantity)?;

    Ok(Json(EstimateResponse {
        quantity,
        unit_rate: pricing.unit_rate,
        price,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub driver_id: ObjectIdString,
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn assign(
    State(pickups): State<PickupCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Payload(request): Payload<AssignRequest>,
) -> Result<Json<Pickup>, Error> {
    user.allow(&[UserRole::Admin])?;
    ensure_driver(&users, request.driver_id.0).await?;

    let mut model = find_scoped(&pickups, PickupScope::All, id).await?;
    let read_at = model.updated_at;
    tracing::debug!(
        "assigning driver {} to pickup in status {}",
        request.driver_id.0,
        model.status
    );
    model.assign(request.driver_id.0, bson::DateTime::now());
    pickups.save(&model, read_at).await?;

    Ok(Json(model.into()))
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn start(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<Pickup>, Error> {
    let user = user.allow(&[UserRole::Driver])?;

    let mut model = find_scoped(&pickups, PickupScope::AssignedTo(user.id), id).await?;
    let read_at = model.updated_at;
    model.start(bson::DateTime::now());
    pickups.save(&model, read_at).await?;

    Ok(Json(model.into()))
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn complete(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<Pickup>, Error> {
    let user = user.allow(&[UserRole::Driver])?;

    let mut model = find_scoped(&pickups, PickupScope::AssignedTo(user.id), id).await?;
    let read_at = model.updated_at;
    model.complete(bson::DateTime::now());
    pickups.save(&model, read_at).await?;

    Ok(Json(model.into()))
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn cancel(
    State(pickups): State<PickupCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
) -> Result<Json<Pickup>, Error> {
    let user = user.allow(&[UserRole::User])?;

    let mut model = find_scoped(&pickups, PickupScope::OwnedBy(user.id), id).await?;
    let read_at = model.updated_at;
    model
        .cancel(bson::DateTime::now())
        .tap_err(|err| tracing::debug!("{}", err))?;
    pickups.save(&model, read_at).await?;

    Ok(Json(model.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub pickup_date: Option<String>,
    pub status: Option<PickupStatus>,
    pub waste_type: Option<WasteType>,
    pub quantity: Option<f64>,
    pub pickup_address: Option<Address>,
    pub images: Option<Vec<String>>,
    pub special_instructions: Option<String>,
    pub notes: Option<String>,
    pub assigned_driver_id: Option<ObjectIdString>,
    pub driver: Option<ObjectIdString>,
    pub price: Option<f64>,
    pub payment_status: Option<PaymentStatus>,
}

impl UpdateRequest {
    /// Either driver field may be sent; `assignedDriverId` takes precedence.
    fn driver_reference(&self) -> Option<ObjectId> {
        self.assigned_driver_id.or(self.driver).map(|it| it.0)
    }
}

#[tracing::instrument(skip_all, fields(user = ?user, id = %id))]
pub async fn update(
    State(pickups): State<PickupCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(id): PathObjectId,
    Payload(request): Payload<UpdateRequest>,
) -> Result<Json<Pickup>, Error> {
    user.allow(&[UserRole::Admin])?;

    if let Some(driver_id) = request.driver_reference() {
        ensure_driver(&users, driver_id).await?;
    }

    let mut model = find_scoped(&pickups, PickupScope::All, id).await?;
    let read_at = model.updated_at;
    model.apply(request, bson::DateTime::now())?;
    pickups.save(&model, read_at).await?;

    Ok(Json(model.into()))
}
