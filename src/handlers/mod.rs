pub mod auth;
pub mod health_handlers;
pub mod transfer_handlers;
pub mod upload_handlers;
