use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization},
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    config::AdminSeed,
    error::{Error, UnauthorizedType},
    mongo_ext::Collection,
    util::{hash_password, verify_password, FormattedDateTime, ObjectIdString, Payload},
};

use super::token::{decode_access_token, generate_access_token, JwtState};

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Driver,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Driver => "driver",
            Self::Admin => "admin",
        }
    }
}

/// The authenticated caller. Identity comes from the bearer token, the role from the stored user,
/// so a role change or deletion takes effect on the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccess {
    pub id: ObjectId,
    pub role: UserRole,
}

impl UserAccess {
    /// Role gate for a route. Authentication has already happened when this is reachable.
    pub fn allow(self, roles: &[UserRole]) -> Result<Self, Error> {
        if roles.contains(&self.role) {
            Ok(self)
        } else {
            Err(Error::Forbidden).tap_err(|_| {
                tracing::debug!(
                    "role {} tried accessing a route for {:?}",
                    self.role.as_str(),
                    roles
                )
            })
        }
    }
}

impl From<&UserModel> for UserAccess {
    fn from(value: &UserModel) -> Self {
        Self {
            id: value.id,
            role: value.role,
        }
    }
}

/// Verifies `token` and loads the user it was issued for.
pub async fn authenticate(
    jwt_state: &JwtState,
    users: &UserCollection,
    token: &str,
) -> Result<UserModel, Error> {
    let token = decode_access_token(jwt_state, token)
        .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
        .tap_err(|_| tracing::debug!("rejected malformed access token"))?;

    if token.claims.is_expired() {
        tracing::debug!("rejected expired access token");
        return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }

    UserModel::from_id(token.claims.sub.0, users).await
}

async fn bearer_user<S>(parts: &mut Parts, state: &S) -> Result<UserModel, Error>
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    let TypedHeader(Authorization(token)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| Error::Unauthorized(UnauthorizedType::MissingAccessToken))?;

    let jwt = JwtState::from_ref(state);
    let users = UserCollection::from_ref(state);

    authenticate(&jwt, &users, token.token()).await
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAccess
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        bearer_user(parts, state).await.map(|it| Self::from(&it))
    }
}

impl UserModel {
    pub async fn from_id(id: ObjectId, users: &UserCollection) -> Result<Self, Error> {
        users
            .find_one_by_id(id)
            .await?
            .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
            .tap_err(|_| tracing::debug!("token issued for missing user {}", id))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserModel
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        bearer_user(parts, state).await
    }
}

/// A user as shown to clients; never carries the password hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: ObjectIdString,

    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub address: Option<String>,
    pub phone: Option<String>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            role: value.role,
            address: value.address,
            phone: value.phone,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6, max = 64))]
    pub password: String,

    #[serde(default)]
    pub role: Option<UserRole>,

    #[validate(length(max = 256))]
    pub address: Option<String>,

    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

#[derive(Validate, Debug, Clone)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6, max = 64))]
    pub password: String,

    pub role: UserRole,
    pub address: Option<String>,
    pub phone: Option<String>,
}

pub async fn create_user(
    users: &UserCollection,
    argon: &Argon2<'_>,
    request: CreateUserRequest,
) -> Result<UserModel, Error> {
    request.validate()?;

    if users.exists(bson::doc! { "email": &request.email }).await? {
        return Err(Error::MustUniqueError("email".to_string()))
            .tap_err(|_| tracing::debug!("tried registering a taken email"));
    }

    let now = OffsetDateTime::now_utc();
    let model = UserModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(argon, &request.password)?,
        role: request.role,
        address: request.address,
        phone: request.phone,
        created_at: now.into(),
        updated_at: now.into(),
    };
    users.insert_unique(&model, "email").await?;

    Ok(model)
}

/// Creates the configured admin account unless a user with that email already exists.
pub async fn seed_admin(
    users: &UserCollection,
    argon: &Argon2<'_>,
    seed: &AdminSeed,
) -> Result<Option<UserModel>, Error> {
    if users.exists(bson::doc! { "email": &seed.email }).await? {
        return Ok(None);
    }

    tracing::info!("seeding admin account {}", seed.email);
    create_user(
        users,
        argon,
        CreateUserRequest {
            name: seed.name.clone(),
            email: seed.email.clone(),
            password: seed.password.clone(),
            role: UserRole::Admin,
            address: None,
            phone: None,
        },
    )
    .await
    .map(Some)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionResponse {
    pub token: String,
    pub expired_at: FormattedDateTime,
    pub user: UserResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn register(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    State(jwt_state): State<JwtState>,
    Payload(request): Payload<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), Error> {
    request.validate()?;

    let role = request.role.unwrap_or_default();
    match role {
        UserRole::Admin => {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("tried registering as admin"))
        }
        UserRole::User | UserRole::Driver => {}
    }

    let user = create_user(
        &users,
        &argon,
        CreateUserRequest {
            name: request.name,
            email: request.email,
            password: request.password,
            role,
            address: request.address,
            phone: request.phone,
        },
    )
    .await?;

    let token = generate_access_token(&jwt_state, &user)?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token: token.token,
            expired_at: token.expired_at.into(),
            user: user.into(),
            message: Some("Registration successful".to_string()),
        }),
    ))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn login(
    State(users): State<UserCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Payload(request): Payload<LoginRequest>,
) -> Result<Json<SessionResponse>, Error> {
    let user = users
        .find_one(
            bson::doc! {
                "email": &request.email
            },
            None,
        )
        .await?;

    let user = match user {
        Some(user) if verify_password(&argon, &request.password, &user.password) => user,
        _ => {
            return Err(Error::Unauthorized(UnauthorizedType::WrongEmailOrPassword))
                .tap_err(|_| tracing::debug!("failed login"))
        }
    };

    let token = generate_access_token(&jwt_state, &user)?;

    Ok(Json(SessionResponse {
        token: token.token,
        expired_at: token.expired_at.into(),
        user: user.into(),
        message: None,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

/// Tokens are stateless, so there is nothing to revoke server side.
pub async fn logout() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Logout successful".to_string(),
    })
}
