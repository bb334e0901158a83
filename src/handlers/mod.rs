pub mod config;
pub mod questions;

pub use config::*;
pub use questions::*;

use crate::answers::{StaticIdentity, UserIdentity};
use actix_web::HttpRequest;

/// Set by the authenticating proxy in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const EMAIL_VERIFIED_HEADER: &str = "x-email-verified";

/// The caller's identity as asserted by the upstream auth layer.
pub fn request_identity(req: &HttpRequest) -> StaticIdentity {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let user = header(USER_ID_HEADER).map(|user_id| UserIdentity {
        user_id: user_id.to_string(),
        email_verified: matches!(header(EMAIL_VERIFIED_HEADER), Some("true") | Some("1")),
    });
    StaticIdentity(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_request_identity() {
        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, "u1"))
            .insert_header((EMAIL_VERIFIED_HEADER, "true"))
            .to_http_request();
        let identity = request_identity(&req);
        assert_eq!(
            identity.0,
            Some(UserIdentity {
                user_id: "u1".to_string(),
                email_verified: true
            })
        );

        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, "u1"))
            .to_http_request();
        assert_eq!(request_identity(&req).0.map(|u| u.email_verified), Some(false));

        let req = TestRequest::default().to_http_request();
        assert!(request_identity(&req).0.is_none());
    }
}
