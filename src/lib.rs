//! ICP record lookup client: solves the image-based verification
//! challenge, negotiates request-signing credentials, and drives paced
//! queries through a rotating pool of egress proxies.

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod models;
pub mod onnx;
pub mod proxy;
pub mod retry;
pub mod sink;
pub mod transport;
pub mod vision;
