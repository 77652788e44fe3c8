use std::sync::atomic::{AtomicBool, Ordering};

/// Global readiness flag, set once the streaming gateway has bound its listener.
///
/// The readiness probe endpoint reports 503 until this is true.
static GATEWAY_BOUND: AtomicBool = AtomicBool::new(false);

/// Mark the service as ready to accept observers.
pub fn mark_ready(addr: &std::net::SocketAddr) {
    GATEWAY_BOUND.store(true, Ordering::SeqCst);
    log::info!("Streaming gateway bound on {addr}, service is ready");
}

/// Mark the service as no longer accepting observers (shutdown in progress).
pub fn mark_unready() {
    GATEWAY_BOUND.store(false, Ordering::SeqCst);
    log::debug!("Readiness status cleared");
}

pub fn is_ready() -> bool {
    GATEWAY_BOUND.load(Ordering::SeqCst)
}
