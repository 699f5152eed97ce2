use std::{io::Write, sync::Mutex};

use anyhow::Result;
use log::{Level, LevelFilter, Metadata, Record};
use termcolor::{BufferedStandardStream, Color, ColorChoice, ColorSpec, WriteColor};
use time::{OffsetDateTime, macros::format_description};

use crate::context::REQ_CONTEXT;

/// Logger of the proxy. Lines read
/// `[time] <client>><listener> [(<destination>)] [LEVEL] <message>`: the time
/// is shown from the debug level on, the connection part when logging from a
/// connection task.
pub(crate) struct Logger {
    max_level: LevelFilter,
    /// Errors go to stderr, everything else to stdout.
    stdout: Mutex<BufferedStandardStream>,
    stderr: Mutex<BufferedStandardStream>,
}

impl Logger {
    pub(crate) fn init(max_level: LevelFilter) -> Result<()> {
        log::set_max_level(max_level);
        log::set_boxed_logger(Box::new(Self {
            max_level,
            stdout: Mutex::new(BufferedStandardStream::stdout(ColorChoice::Auto)),
            stderr: Mutex::new(BufferedStandardStream::stderr(ColorChoice::Auto)),
        }))?;
        Ok(())
    }

    fn write_line<W: WriteColor>(&self, out: &mut W, record: &Record) -> Result<()> {
        let verbose = self.max_level >= LevelFilter::Debug;

        // Exchanges and tunnels can last, timestamps help following them.
        if verbose {
            OffsetDateTime::now_utc().format_into(
                out,
                format_description!("[hour]:[minute]:[second]:[subsecond digits:6] "),
            )?;
        }

        write_connection(out)?;

        if verbose || record.level() <= Level::Warn {
            out.set_color(ColorSpec::new().set_fg(level_color(record.level())))?;
            write!(out, "{:5} ", record.level())?;
            out.reset()?;
        }

        writeln!(out, "{}", record.args())?;
        out.flush()?;
        Ok(())
    }
}

/// Writes the client and listener addresses of the current connection, and
/// its destination once known. Listener and startup logs have none.
fn write_connection<W: WriteColor>(out: &mut W) -> Result<()> {
    REQ_CONTEXT
        .try_with(|context| -> Result<()> {
            let context = context.borrow();
            write!(out, "{}>{} ", context.peer, context.local)?;
            if let Some(target) = &context.target {
                write!(out, "({target}) ")?;
            }
            Ok(())
        })
        .unwrap_or(Ok(()))
}

fn level_color(level: Level) -> Option<Color> {
    Some(match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::Blue,
        Level::Debug => Color::Cyan,
        Level::Trace => Color::White,
    })
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let stream = match record.level() {
            Level::Error => &self.stderr,
            _ => &self.stdout,
        };
        // A thread panicking while logging must not silence the others.
        let mut out = stream.lock().unwrap_or_else(|e| e.into_inner());

        // Nowhere left to report a logging failure.
        let _ = self.write_line(&mut *out, record);
    }

    fn flush(&self) {
        for stream in [&self.stdout, &self.stderr] {
            let _ = stream.lock().unwrap_or_else(|e| e.into_inner()).flush();
        }
    }
}
