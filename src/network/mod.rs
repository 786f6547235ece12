pub mod ota_routes;
pub mod validators;

pub use ota_routes::{OtaQuery, OtaResponse, OtaService};
