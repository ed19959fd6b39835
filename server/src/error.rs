use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::v1::pickup::PickupStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("{0}")]
    InvalidQuery(#[from] QueryRejection),

    #[error("Cannot {action} a pickup with status \"{status}\"")]
    InvalidTransition {
        action: &'static str,
        status: PickupStatus,
    },

    #[error("{0} not found")]
    NotFound(Uri),

    #[error("{0} not found")]
    EntityNotFound(&'static str),

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0} must be unique")]
    MustUniqueError(String),

    #[error("{0} was modified by another request, reload and retry")]
    Conflict(&'static str),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("Access denied: insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    BSONDeError(#[from] bson::de::Error),

    #[error("Something went wrong")]
    Panic,
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Wrong email or password")]
    WrongEmailOrPassword,

    #[error("No token provided")]
    MissingAccessToken,

    #[error("Invalid access token")]
    InvalidAccessToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
    pub r#type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// `IntoResponse` has no access to application state, so the development flag is latched
// once by `app::router` from the loaded `Config`.
static DETAIL: std::sync::OnceLock<bool> = std::sync::OnceLock::new();

fn expose_detail() -> bool {
    DETAIL.get().copied().unwrap_or(false)
}

/// Enables the `detail` field of 500 responses.
pub fn expose_internal_detail(enabled: bool) {
    let _ = DETAIL.set(enabled);
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(..)
            | Self::InvalidInput(..)
            | Self::InvalidBody(..)
            | Self::InvalidQuery(..)
            | Self::InvalidTransition { .. }
            | Self::MustUniqueError(..) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(..) => StatusCode::CONFLICT,
            Self::NotFound(..) | Self::EntityNotFound(..) | Self::NoResource => {
                StatusCode::NOT_FOUND
            }
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..)
            | Self::BSONDeError(..)
            | Self::Panic => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let r#type = err.to_string_variant();
        let internal = err.status() == StatusCode::INTERNAL_SERVER_ERROR;

        let (message, detail) = if internal {
            let detail = Some(err.to_string()).filter(|_| expose_detail());
            ("Internal server error".to_string(), detail)
        } else {
            (err.to_string(), None)
        };

        let errors = match err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::InvalidInput(..)
            | Error::InvalidBody(..)
            | Error::InvalidQuery(..)
            | Error::InvalidTransition { .. }
            | Error::NotFound(..)
            | Error::EntityNotFound(..)
            | Error::NoResource
            | Error::PasswordHashError(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::MustUniqueError(..)
            | Error::Conflict(..)
            | Error::Unauthorized(..)
            | Error::Forbidden
            | Error::BSONSerError(..)
            | Error::BSONDeError(..)
            | Error::Panic => None,
        };

        Self {
            errors,
            r#type,
            message,
            detail,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = self.status();
        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl Error {
    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            ValidationError(..),
            InvalidInput(..),
            InvalidBody(..),
            InvalidQuery(..),
            InvalidTransition {..},
            NotFound(..),
            EntityNotFound(..),
            NoResource!,
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            MustUniqueError(..),
            Conflict(..),
            Unauthorized(..),
            Forbidden!,
            BSONSerError(..),
            BSONDeError(..),
            Panic!
        }
        .to_string()
    }
}

impl From<PathRejection> for Error {
    fn from(_value: PathRejection) -> Self {
        Self::NoResource
    }
}

#[cfg(test)]
mod tests {
    use validator::Validate;

    use super::*;

    #[derive(Validate)]
    struct Named {
        #[validate(length(min = 1))]
        name: String,
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::Conflict("Pickup").status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::EntityNotFound("Pickup").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::InvalidInput("bad".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::InvalidTransition {
                action: "cancel",
                status: PickupStatus::Completed
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Panic.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_transition_message_names_status() {
        let err = Error::InvalidTransition {
            action: "cancel",
            status: PickupStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Cannot cancel a pickup with status \"in_progress\""
        );
    }

    #[test]
    fn test_error_json() {
        let err = Named {
            name: String::new(),
        }
        .validate()
        .unwrap_err();

        let json = ErrorJson::from(Error::from(err));
        assert_eq!(json.r#type, "ValidationError");
        assert!(json.errors.is_some());

        let json = ErrorJson::from(Error::EntityNotFound("Pickup"));
        assert_eq!(json.r#type, "EntityNotFound");
        assert_eq!(json.message, "Pickup not found");
        assert!(json.errors.is_none());
        assert!(json.detail.is_none());

        let json = ErrorJson::from(Error::Panic);
        assert_eq!(json.message, "Internal server error");
    }
}
