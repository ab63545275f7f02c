pub mod export;
pub mod http;

pub use http::{HttpGateway, HttpGatewayError};
