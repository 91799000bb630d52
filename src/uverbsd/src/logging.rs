use std::fmt;
use std::path::Path;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use uverbs::Config;

// The code is adapted from tokio-rs/tracing/tracing-subscriber
struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    pub(crate) fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ansi {
            match *self.level {
                Level::TRACE => write!(f, "{}", Colour::Purple.paint(TRACE_STR)),
                Level::DEBUG => write!(f, "{}", Colour::Blue.paint(DEBUG_STR)),
                Level::INFO => write!(f, "{}", Colour::Green.paint(INFO_STR)),
                Level::WARN => write!(f, "{}", Colour::Yellow.paint(WARN_STR)),
                Level::ERROR => write!(f, "{}", Colour::Red.paint(ERROR_STR)),
            }
        } else {
            match *self.level {
                Level::TRACE => f.pad(TRACE_STR),
                Level::DEBUG => f.pad(DEBUG_STR),
                Level::INFO => f.pad(INFO_STR),
                Level::WARN => f.pad(WARN_STR),
                Level::ERROR => f.pad(ERROR_STR),
            }
        }
    }
}

/// `[time LEVEL thread file:line] message`
struct UverbsFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for UverbsFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel::new(metadata.level(), self.ansi && writer.has_ansi_escapes());
        let thread = std::thread::current();

        write!(
            writer,
            "[{} {} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            thread.name().unwrap_or("<unnamed>"),
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    const LOG_ENV: &str = "UVERBS_LOG";
    Ok(EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy())
}

/// Logs to stdout, filtered by `UVERBS_LOG` or else the configured level. With `log_file` set,
/// the same events are also appended to that file through a background writer; the returned
/// guard flushes it on drop.
pub fn init_log(
    config: &Config,
    ansi: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(UverbsFormatter { ansi })
        .with_filter(env_filter(&config.log_level)?);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    match &config.log_file {
        Some(log_file) => {
            let path = Path::new(log_file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file {:?} names no file", log_file))?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(UverbsFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_filter(env_filter(&config.log_level)?);
            registry.with(file_layer).init();
            tracing::info!("tracing-log initialized, mirrored to {}", log_file);
            Ok(Some(guard))
        }
        None => {
            registry.init();
            tracing::info!("tracing-log initialized");
            Ok(None)
        }
    }
}
