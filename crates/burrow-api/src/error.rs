use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use burrow_net::alloc::AllocError;
use burrow_net::peers::PeerError;
use burrow_net::provision::ProvisionError;

use crate::db::user::UserStoreError;
use crate::db::wireguard::WgStoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("email already taken")]
    DuplicateEmail,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("user has no provisioned network")]
    NoServer,

    #[error("no free peer addresses in this network")]
    SubnetFull,

    #[error("network parameters collide with an existing user")]
    DerivedParamsTaken,

    #[error("internal server error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateEmail | Self::DerivedParamsTaken => StatusCode::CONFLICT,
            Self::Validation(_) | Self::NoServer | Self::SubnetFull => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<UserStoreError> for ApiError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::DuplicateEmail => Self::DuplicateEmail,
            UserStoreError::PasswordHash | UserStoreError::Database(_) => {
                tracing::error!(error = %err, "user store error");
                Self::Internal
            }
        }
    }
}

impl From<WgStoreError> for ApiError {
    fn from(err: WgStoreError) -> Self {
        match err {
            WgStoreError::DuplicateServer | WgStoreError::DerivedParamsTaken => {
                Self::DerivedParamsTaken
            }
            WgStoreError::Database(_) => {
                tracing::error!(error = %err, "wireguard store error");
                Self::Internal
            }
        }
    }
}

impl From<PeerError> for ApiError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::NoServer => Self::NoServer,
            PeerError::NotFound => Self::NotFound,
            PeerError::NotOwned => Self::Forbidden,
            PeerError::InvalidAllowedIps(entry) => {
                Self::Validation(format!("invalid allowed_ips entry {entry:?}"))
            }
            PeerError::NoChanges => Self::Validation("no fields to update".into()),
            PeerError::Alloc(AllocError::SubnetExhausted) => Self::SubnetFull,
            PeerError::Alloc(_)
            | PeerError::Command(_)
            | PeerError::Wireguard(_)
            | PeerError::Catalog(_) => {
                tracing::error!(error = %err, "peer saga error");
                Self::Internal
            }
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::NamespaceExists(_) => Self::DerivedParamsTaken,
            ProvisionError::InvalidUid(_)
            | ProvisionError::Command(_)
            | ProvisionError::Wireguard(_) => {
                tracing::error!(error = %err, "provisioning error");
                Self::Internal
            }
        }
    }
}
