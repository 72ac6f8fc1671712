//! Domain models for the template store.

pub mod order;
pub mod template;
pub mod user;

pub use order::{NewOrder, Order};
pub use template::Template;
pub use user::{AuthUser, User};
