// Domain records
pub mod models;

// Consumption pipeline
pub mod stream;
