use flexi_logger::{DeferredNow, FlexiLoggerError, LogSpecification, Logger, LoggerHandle, Record};
use log::error;
use std::fmt::Debug;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M.%S%.f%z";

pub fn format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "[{}] {} [{}] {}",
        now.now_utc_owned().format(TIMESTAMP_FORMAT),
        record.level(),
        record.module_path().unwrap_or("<unnamed>"),
        &record.args()
    )
}

/// Diagnostics go to stderr; stdout is reserved for the manager's console
/// surface (progress lines, task output).
pub fn init(specification: LogSpecification) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::with(specification)
        .log_to_stderr()
        .format(format)
        .start()
}

pub fn log_and_return_error<T>(error: T) -> T
where
    T: Debug,
{
    error!("{error:?}");
    error
}
