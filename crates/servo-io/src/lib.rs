pub mod blaster;
pub mod metrics;

pub use blaster::{
    daemon_running, open_pipe, open_sink, try_open_sink, BlasterError, SinkConfig,
    DEFAULT_PIPE_PATH,
};
pub use metrics::{init_metrics, serve_metrics};
