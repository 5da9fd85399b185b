//! Authenticated subject extraction
//!
//! Session and cookie handling terminate at the edge; by the time a request
//! reaches this service the gateway has resolved the caller to a subject and
//! forwards it in trusted headers. Handlers never see raw credentials.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use trackly_shared::SubjectKind;
use uuid::Uuid;

pub const SUBJECT_ID_HEADER: &str = "x-subject-id";
pub const SUBJECT_KIND_HEADER: &str = "x-subject-kind";

/// The resolved subject making this request
#[derive(Debug, Clone, Copy)]
pub struct AuthSubject {
    pub subject_id: Uuid,
    pub subject_kind: SubjectKind,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthSubject
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let subject_id = parts
            .headers
            .get(SUBJECT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or((StatusCode::UNAUTHORIZED, "missing or invalid subject"))?;

        let subject_kind = parts
            .headers
            .get(SUBJECT_KIND_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.parse::<SubjectKind>())
            .transpose()
            .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid subject kind"))?
            .unwrap_or(SubjectKind::User);

        Ok(AuthSubject {
            subject_id,
            subject_kind,
        })
    }
}
