use std::io::Write;
use std::time::Instant;

use log::{Level, LevelFilter};
use nu_ansi_term::{Color, Style};

/// Stderr logger stamping each line with the time since startup.
///
/// Protocol traces are read against retransmit intervals and handshake
/// deadlines, so a monotonic offset is more useful than wall-clock time:
/// "the stall fired 2.001s after the ack" falls straight out of the
/// margins.
pub struct Logger {
	start: Instant,
}

impl Logger {
	pub fn init(level: LevelFilter) {
		let logger = Box::leak(Box::new(Logger { start: Instant::now() }));

		if log::set_logger(logger).is_ok() {
			log::set_max_level(level);
		}
	}

	/// Whole-line styling by severity: problems stand out, chatter fades.
	fn style(level: Level) -> Style {
		match level {
			Level::Error => Color::Red.bold(),
			Level::Warn => Color::Yellow.normal(),
			Level::Info => Style::new(),
			Level::Debug => Style::new().dimmed(),
			Level::Trace => Color::Purple.dimmed(),
		}
	}
}

impl log::Log for Logger {
	fn enabled(&self, meta: &log::Metadata) -> bool {
		meta.level() <= log::max_level()
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let t = self.start.elapsed();

		let line = format!(
			"[{:4}.{:03}] {:5} {}: {}",
			t.as_secs(),
			t.subsec_millis(),
			record.level(),
			record.target(),
			record.args()
		);

		let mut err = std::io::stderr().lock();
		let _ = writeln!(err, "{}", Self::style(record.level()).paint(line));
	}

	fn flush(&self) {}
}
