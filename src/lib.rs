//! Firmup - staged over-the-air firmware upgrade core
//!
//! Chunked, acknowledged, base64-encoded file reception into a staging
//! tree, followed by a backup -> apply -> cleanup commit with a
//! threshold-guarded rollback path.

pub mod apply;
pub mod backup;
pub mod checksum;
pub mod cleanup;
pub mod config;
pub mod decode;
pub mod error;
pub mod fsops;
pub mod logger;
pub mod memory;
pub mod net;
pub mod notify;
pub mod pipeline;
pub mod protocol;
pub mod rollback;
pub mod router;
pub mod sandbox;
pub mod scan;
pub mod session;
