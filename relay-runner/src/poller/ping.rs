//! Ping handler.

use relay_api::messages::{PingRequest, PingResponse};
use tracing::info;

/// Ping does nothing except prove the runner is alive.
pub(super) fn process(_request: PingRequest) -> PingResponse {
    info!("received ping request");
    PingResponse::default()
}
