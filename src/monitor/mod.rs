pub mod loops;
pub mod session;
pub mod shutdown;

pub use loops::{run_capture_loop, run_export_loop, run_metrics_loop, run_probe_loop, run_rate_loop};
pub use session::{run_session, SessionOutcome, SessionParts};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownHandle};
