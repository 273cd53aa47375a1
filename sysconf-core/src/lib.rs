pub mod model;
pub mod store_api;
