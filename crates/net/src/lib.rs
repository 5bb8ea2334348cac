//! HTTP implementation of `fieldsync_core::NetworkPort` against the cloud
//! sync API (§6).

mod client;
mod error;

pub use client::ReqwestNetworkPort;
pub use error::NetError;
