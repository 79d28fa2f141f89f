/// Map the -v count onto log filters and install the logger.
///
/// Warnings and errors are always shown; the daq crates themselves get more
/// detail as the verbosity goes up. Info lines are printed bare so the run
/// output stays readable, everything else is tagged with its level.
pub fn init(verbosity: u8) {
	use std::io::Write;

	let detail = match verbosity {
		0 => "info",
		1 => "debug",
		_ => "trace",
	};

	env_logger::Builder::new()
		.parse_filters(&format!("warn,mini_daq={0},mvlc={0}", detail))
		.format(|buffer, record| {
			if record.level() == log::Level::Info {
				return writeln!(buffer, "{}", record.args());
			}

			let mut tag = buffer.style();
			if record.level() <= log::Level::Warn {
				tag.set_bold(true);
			}
			writeln!(buffer, "{}: {}", tag.value(record.level().to_string().to_lowercase()), record.args())
		})
		.init();
}
