use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{error::Error, util::ObjectIdString};

use super::auth::{UserModel, UserRole};

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,
    ttl: Duration,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let encoding_key = jsonwebtoken::EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        // expiry is checked against our own clock in `AccessTokenClaims::is_expired`
        validation.validate_exp = false;

        Self {
            header,
            validation,
            ttl,

            encoding_key,
            decoding_key,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessTokenClaims {
    pub sub: ObjectIdString,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp <= current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    user: &UserModel,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + jwt_state.ttl;
    let token = generate_access_token_with_exp(jwt_state, user, expired_at.unix_timestamp())?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    user: &UserModel,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            sub: user.id.into(),
            role: user.role,
            iat: current_timestamp().unix_timestamp(),
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}
