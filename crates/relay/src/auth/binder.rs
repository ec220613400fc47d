use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, RelayError},
    store::UserStore,
};

/// Who is on the other end of a connection. Bound once at upgrade time and
/// never changed for the lifetime of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Turns a raw access token into a trusted [`Identity`].
pub struct IdentityBinder {
    jwt_service: JwtAccessTokenService,
    users: UserStore,
}

impl IdentityBinder {
    pub fn new(jwt_service: JwtAccessTokenService, users: UserStore) -> Self {
        Self { jwt_service, users }
    }

    /// Validates the token and resolves the display name. The user store wins
    /// over the token's `name` claim; a store outage degrades to the claim.
    pub async fn bind(&self, token: &str) -> Result<Identity, RelayError> {
        let subject = self.jwt_service.validate_user_token(token).map_err(|error| {
            debug!(error = %error, "rejected access token");
            RelayError::new(ErrorCode::AuthInvalidToken, "invalid bearer token")
        })?;

        let profile = match self.users.get_user(subject.user_id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(user_id = %subject.user_id, error = %error, "user lookup failed, using token claims");
                None
            }
        };

        let display_name = profile
            .map(|profile| profile.display_name)
            .or(subject.display_name)
            .unwrap_or_else(|| fallback_display_name(subject.user_id));

        Ok(Identity { user_id: subject.user_id, display_name })
    }
}

fn fallback_display_name(user_id: Uuid) -> String {
    let simple = user_id.simple().to_string();
    format!("user-{}", &simple[..8])
}
