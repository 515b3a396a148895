//! API endpoint handlers.

pub mod gradcam;
pub mod health;
pub mod models;
pub mod patients;
pub mod predict;
pub mod predictions;
