#![warn(clippy::unwrap_used)]

pub mod rest;
pub mod sequence_rest;
pub mod server;
pub mod swagger;
pub mod tracking_rest;

pub use server::ApiServer;
pub use swagger::ApiDoc;
