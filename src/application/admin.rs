use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("Not authorized")]
    NotAuthorized,
}

/// Proof that the caller was resolved as an administrator.
///
/// Every admin-only operation takes a `&AdminGrant`; the only way to get one
/// is [`AdminGrant::verify`], so authentication stays with the caller while
/// the admin surface stays distinct.
#[derive(Debug)]
pub struct AdminGrant {
    _private: (),
}

impl AdminGrant {
    pub fn verify(is_admin: bool) -> Result<Self, AccessError> {
        if is_admin {
            Ok(Self { _private: () })
        } else {
            Err(AccessError::NotAuthorized)
        }
    }
}
