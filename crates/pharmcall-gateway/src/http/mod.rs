pub mod admin;
pub mod error;
pub mod health;
pub mod jobs;
pub mod webhooks;
