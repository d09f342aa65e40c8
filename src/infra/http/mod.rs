mod admin;
pub mod error;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use public::{HttpState, SESSION_USER_HEADER, build_router};
