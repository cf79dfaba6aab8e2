//! Client-side identity: token decoding, expiry, the issuer boundary and the session manager.
//! Keep the public surface thin and split implementation across sub-modules.

mod claims;
mod expiry;
mod issuer;
mod principal;
mod session;

pub use claims::{decode_claims, Claims, DecodeError};
pub use expiry::{now_secs, ExpiryPolicy, MissingExp};
pub use issuer::{validate_email, HttpIssuer, IssuedData, IssuedToken, Issuer, LoginRequest, SignupRequest, MIN_PASSWORD_LEN};
pub use principal::{IdentitySnapshot, TenantProfile, TenantRef, UserProfile};
pub use session::{SessionManager, SessionState};
