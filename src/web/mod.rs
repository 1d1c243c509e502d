//! HTTP integration: the admission layer and the demo server.

mod extract;
mod layer;
mod server;
mod sink;

pub use extract::{ForwardedFor, HeaderKey, KeyExtractor, PeerAddr};
pub use layer::{
    AdmissionLayer, AdmissionOptions, AdmissionService, RATE_LIMIT_MESSAGE, X_PROCESS_TIME,
};
pub use server::HttpServer;
pub use sink::{LogSink, NullSink, TracingSink};
