use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{error::Error, mongo_ext::unique_violation, util::Payload};

use super::auth::{UserAccess, UserCollection, UserModel, UserResponse, UserRole};

pub async fn profile(user: UserModel) -> Json<UserResponse> {
    Json(user.into())
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: Option<String>,

    #[validate(email)]
    pub email: Option<String>,

    #[validate(length(max = 256))]
    pub address: Option<String>,

    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn update_profile(
    State(users): State<UserCollection>,
    user: UserModel,
    Payload(request): Payload<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, Error> {
    request.validate()?;

    if let Some(email) = &request.email {
        if email != &user.email
            && users
                .exists(bson::doc! { "email": email, "_id": { "$ne": user.id } })
                .await?
        {
            return Err(Error::MustUniqueError("email".to_string()))
                .tap_err(|_| tracing::debug!("tried taking another user's email"));
        }
    }

    let user = UserModel {
        name: request.name.unwrap_or(user.name),
        email: request.email.unwrap_or(user.email),
        address: request.address.or(user.address),
        phone: request.phone.or(user.phone),
        updated_at: OffsetDateTime::now_utc().into(),
        ..user
    };

    users
        .update_one(
            bson::doc! { "_id": user.id },
            bson::doc! {
                "$set": {
                    "name": &user.name,
                    "email": &user.email,
                    "address": &user.address,
                    "phone": &user.phone,
                    "updated_at": user.updated_at,
                }
            },
            None,
        )
        .await
        .map_err(|err| unique_violation(err, "email"))?;

    Ok(Json(user.into()))
}

pub async fn drivers(
    State(users): State<UserCollection>,
    user: UserAccess,
) -> Result<Json<Vec<UserResponse>>, Error> {
    user.allow(&[UserRole::Admin])?;

    let role = bson::to_bson(&UserRole::Driver)?;
    let drivers = users
        .find_all(bson::doc! { "role": role }, bson::doc! { "name": 1 })
        .await?;

    Ok(Json(drivers.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::Json;

    use crate::{
        api::v1::{auth::UserRole, tests::bootstrap},
        error::Error,
        util::Payload,
    };

    use super::UpdateProfileRequest;

    #[tokio::test]
    async fn test_profile() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };

        let Json(profile) = super::profile(bootstrap.user_model.clone()).await;
        assert_eq!(profile.id, bootstrap.user_id());
        assert_eq!(profile.role, UserRole::Admin);

        let serialized = serde_json::to_value(&profile).unwrap();
        assert!(serialized.get("password").is_none());

        bootstrap.teardown().await;
    }

    #[tokio::test]
    async fn test_update_profile() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let customer = bootstrap
            .derive("customer@email.com", "password", UserRole::User)
            .await;

        let Json(updated) = super::update_profile(
            bootstrap.user_collection(),
            customer.user_model.clone(),
            Payload(UpdateProfileRequest {
                name: Some("Customer".to_string()),
                phone: Some("555-0100".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "Customer");
        assert_eq!(updated.phone.as_deref(), Some("555-0100"));
        assert_eq!(updated.email, "customer@email.com");

        let stored = bootstrap
            .app_state
            .user_collection
            .find_one_by_id(customer.user_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "Customer");
        assert_eq!(stored.password, customer.user_model.password);

        let err = super::update_profile(
            bootstrap.user_collection(),
            customer.user_model.clone(),
            Payload(UpdateProfileRequest {
                email: Some(bootstrap.user_model.email.clone()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(_));

        let err = super::update_profile(
            bootstrap.user_collection(),
            customer.user_model.clone(),
            Payload(UpdateProfileRequest {
                email: Some("not-an-email".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::ValidationError(_));

        bootstrap.teardown().await;
    }

    #[tokio::test]
    async fn test_drivers() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let driver = bootstrap
            .derive("driver@email.com", "password", UserRole::Driver)
            .await;
        bootstrap
            .derive("customer@email.com", "password", UserRole::User)
            .await;

        let Json(drivers) = super::drivers(bootstrap.user_collection(), bootstrap.user_access())
            .await
            .unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].id, driver.user_id());

        let err = super::drivers(bootstrap.user_collection(), driver.user_access())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        bootstrap.teardown().await;
    }
}
