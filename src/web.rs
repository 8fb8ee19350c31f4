pub mod handlers;
pub mod schemas;

pub use handlers::routes;
