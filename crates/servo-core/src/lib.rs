pub mod calibration;
pub mod dispatcher;
pub mod error;
pub mod flags;
pub mod rate;
pub mod servo;
pub mod sink;

pub use calibration::{Calibration, NEUTRAL_OUTPUT};
pub use dispatcher::{
    DispatchConfig, DispatchStats, Dispatcher, DispatcherHandle, OutputSource, StatsSnapshot,
};
pub use error::{DispatchError, ServoError, SinkError};
pub use flags::{Flags, MAX_POSITION, MIN_POSITION};
pub use rate::{sample_interval, StepLimiter, STEP_PERIOD};
pub use servo::{Servo, ServoConfig, MAX_SPEED};
pub use sink::{all_off_line, format_batch, CommandSink, DiscardSink, MemorySink, WriterSink};
