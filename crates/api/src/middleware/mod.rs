//! HTTP middleware components.

pub mod identity;
pub mod logging;
pub mod metrics;
pub mod psk;
pub mod trace_id;

pub use identity::require_identity;
pub use metrics::{init_metrics, metrics_handler, metrics_middleware};
pub use psk::{require_psk, PSK_HEADER};
pub use trace_id::{trace_id, RequestId, REQUEST_ID_HEADER};
