use crate::transport::WsTransport;
use std::sync::Arc;
use streamgate_core::IdentityVerifier;
use streamgate_engine::StreamEngine;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: Arc<StreamEngine>,
    pub transport: Arc<WsTransport>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub fn new(
        engine: Arc<StreamEngine>,
        transport: Arc<WsTransport>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            engine,
            transport,
            verifier,
        }
    }
}
