use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;

use crate::GLOBAL;

static EXIT: AtomicBool = AtomicBool::new(false);

/// Initialise a Stakker instance whose monotonic clock starts now,
/// anchored to the wall clock for anything that needs absolute time.
pub fn init() -> Stakker {
	let mut s = Stakker::new(Instant::now());
	s.set_systime(Some(SystemTime::now()));
	s
}

/// What one pass over the poll set decided.
enum Wait {
	/// Sockets were polled (possibly without blocking); run the queues.
	Ran,
	/// No timers and no sockets: nothing can ever wake us again.
	Dead,
}

fn wait_once(stakker: &mut Stakker, now: Instant, idle_work: bool) -> Result<Wait, ()> {
	// With idle-queue work pending, peek at the sockets without blocking;
	// otherwise sleep until the next timer is due.
	let timeout = if idle_work { Some(Duration::ZERO) } else { stakker.next_wait(now) };

	GLOBAL.with(|st| {
		let mut st = st.borrow_mut();

		// A Node registers its socket before its init returns, so an empty
		// poll set means every node is gone; once the timer queue is empty
		// too the process has nothing left to do.
		if timeout.is_none() && !st.is_io() {
			return Ok(Wait::Dead);
		}

		st.poll(timeout)?;
		Ok(Wait::Ran)
	})
}

/// Drive actors and socket I/O until shutdown, Ctrl+C, or there is no
/// work left to wait for.
pub fn exec(stakker: &mut Stakker, exit_fn: impl FnOnce()) -> Result<(), ()> {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed))
		.map_err(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))?;

	let mut now = Instant::now();
	let mut idle_work = stakker.run(now, false);

	while stakker.not_shutdown() {
		if EXIT.load(Ordering::Relaxed) {
			// Let the exit function defer actor cleanup, then run the
			// deferral queue once before leaving.
			exit_fn();
			stakker.run(now, false);
			break;
		}

		match wait_once(stakker, now, idle_work) {
			Ok(Wait::Ran) => {}
			Ok(Wait::Dead) => break,
			Err(()) => {
				// A failed poll is unrecoverable; take the exit path on
				// the next pass so cleanup still runs.
				EXIT.store(true, Ordering::Relaxed);
				continue;
			}
		}

		// Run the idle queue whenever idle work was queued. Fresh packets
		// never depend on idle-queue ordering, so there is no need to
		// check what the poll actually delivered first.
		now = Instant::now();
		idle_work = stakker.run(now, idle_work);
	}

	Ok(())
}
