pub mod cancellation;
pub mod generator;
pub mod provider;
