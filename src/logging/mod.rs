mod pretty_list;

use std::{
    fmt::Write as FmtWrite,
    sync::{Once, OnceLock},
};

use anyhow::Result;
use flexi_logger::{DeferredNow, Logger, LoggerHandle, Record};
use regex::Regex;
use textwrap::{termwidth, Options};

pub use self::pretty_list::PrettyList;

/// The running logger. Dropping the handle would stop logging so it lives for
/// the rest of the process.
static LOGGER_HANDLE: OnceLock<LoggerHandle> = OnceLock::new();

/// Used to synchronize the first call to setup().
static INIT: Once = Once::new();

/// Matches the final wrapped line of a log record. Compiled by setup().
static LAST_LINE_MATCHER: OnceLock<Regex> = OnceLock::new();

/// Setup console logging for applications which use the memory manager.
///
/// The level is read from RUST_LOG and defaults to info. Only the first call
/// has any effect.
pub fn setup() -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = start_logger();
    });
    result
}

fn start_logger() -> Result<()> {
    let _ = LAST_LINE_MATCHER.set(Regex::new(r"(┃)(.*)$")?);
    let handle = Logger::try_with_env_or_str("info")?
        .format(multiline_format)
        .start()?;
    let _ = LOGGER_HANDLE.set(handle);

    log::info!(
        "Adjust the log level by setting RUST_LOG. By default RUST_LOG=info"
    );

    Ok(())
}

/// An opinionated formatting function for flexi_logger which automatically
/// wraps content to the terminal width.
///
/// Records are prefixed with unicode so it's easy to tell where a big log
/// statement, like a memory dump, begins and ends.
pub fn multiline_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    let size = termwidth().min(74);
    let wrap_options = Options::new(size)
        .initial_indent("┏ ")
        .subsequent_indent("┃ ");

    let mut full_line = String::new();
    writeln!(
        full_line,
        "{} [{}] [{}:{}]",
        record.level(),
        now.now().format("%H:%M:%S%.6f"),
        record.file().unwrap_or("<unnamed>"),
        record.line().unwrap_or(0),
    )
    .expect("unable to format first log line");

    write!(&mut full_line, "{}", &record.args())
        .expect("unable to format log!");

    let wrapped = textwrap::fill(&full_line, wrap_options);
    match LAST_LINE_MATCHER.get() {
        Some(matcher) => writeln!(w, "{}", matcher.replace(&wrapped, "┗$2")),
        None => writeln!(w, "{}", wrapped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_can_be_called_more_than_once() {
        setup().unwrap();
        setup().unwrap();
        log::debug!("logging is configured");
    }

    #[test]
    fn last_line_is_closed_with_a_corner() {
        setup().unwrap();
        let matcher = LAST_LINE_MATCHER.get().unwrap();

        let wrapped = "┏ first\n┃ middle\n┃ last";
        let formatted = matcher.replace(wrapped, "┗$2");

        assert_eq!(formatted, "┏ first\n┃ middle\n┗ last");
    }
}
