use std::time::SystemTime;

/// Get the current system time as seen by the runtime's monotonic clock.
pub fn system(core: &stakker::Core) -> SystemTime {
	let time = core.systime();
	let dur = core.now() - core.start_instant();
	time + dur
}

/// Get the UNIX time in seconds.
pub fn unix(core: &stakker::Core) -> u64 {
	system(core)
		.duration_since(SystemTime::UNIX_EPOCH)
		.expect("The current time should be after the UNIX epoch")
		.as_secs()
}
