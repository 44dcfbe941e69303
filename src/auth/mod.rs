//! Authentication
//! Mission: Bearer-token validation at the edge; identity issuance lives elsewhere

mod jwt;
mod middleware;
mod models;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, require_admin, AuthError};
pub use models::{Claims, Role};
