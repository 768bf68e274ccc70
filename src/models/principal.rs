use uuid::Uuid;

use super::user::Role;

/// The authenticated caller, recovered from a verified access token.
///
/// Inserted into request extensions by `require_auth`; this is the only view
/// of the session core that the rest of the storefront consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    /// The ID of the authenticated user.
    pub user_id: Uuid,
    /// The user's role at issuance time.
    pub role: Role,
}
