//! Scheduler tracing (`trace` feature): typed zone spans for the dispatch
//! phases and a span per fiber occupation of a worker, exported as Chrome
//! Tracing JSON for chrome://tracing or ui.perfetto.dev.
//!
//! Recording is contention-free: every thread appends to its own buffer
//! and hands it to the collector when it flushes (workers flush as they
//! exit). Each worker gets its own lane in the exported timeline; fiber
//! spans carry the fiber id so a suspended task can be followed across the
//! workers that resume it. With the feature disabled every hook compiles
//! away.

#[cfg(feature = "trace")]
mod imp {
    use crate::fiber::FiberId;
    use std::cell::{Cell, RefCell};
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::sync::Mutex;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    /// Timeline lane for events recorded off any worker (an unregistered
    /// thread touching a counter, for example).
    const OUTSIDE_LANE: usize = 1 << 16;

    /// Dispatch phases that receive a span.
    #[derive(Clone, Copy, Debug)]
    pub enum Zone {
        /// A task body executing on its fiber.
        Task,
        /// The completing task decrementing its counter.
        TaskEnd,
        /// Dropping the completed task's captures.
        PostTask,
        /// Zero-wait fast path draining in-flight counter notifiers.
        WaitThread,
        /// A wait that resolved before parking; its bundle is discarded.
        ReleaseFiberBundle,
    }

    impl Zone {
        fn label(self) -> &'static str {
            match self {
                Zone::Task => "Task",
                Zone::TaskEnd => "TaskEnd",
                Zone::PostTask => "PostTask",
                Zone::WaitThread => "WaitThread",
                Zone::ReleaseFiberBundle => "ReleaseFiberBundle",
            }
        }
    }

    enum Span {
        Zone(Zone),
        /// One fiber occupying one worker between two switches.
        Fiber(FiberId),
    }

    struct Event {
        span: Span,
        /// Worker lane the event was recorded on, if the thread registered.
        worker: Option<usize>,
        start_us: u64,
        duration_us: u64,
    }

    /// Flushed events plus the clock anchor shared by every thread.
    struct Collector {
        epoch: Instant,
        epoch_unix_us: u64,
        merged: Mutex<Vec<Event>>,
    }

    lazy_static::lazy_static! {
        static ref COLLECTOR: Collector = Collector {
            epoch: Instant::now(),
            epoch_unix_us: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|offset| offset.as_micros() as u64)
                .unwrap_or(0),
            merged: Mutex::new(Vec::new()),
        };
    }

    thread_local! {
        static LOCAL_EVENTS: RefCell<Vec<Event>> = RefCell::new(Vec::new());
        static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
    }

    /// Tags the calling thread with its worker index so the events it
    /// records land in that lane. Each worker registers at startup; the
    /// initializing thread registers as worker 0.
    pub fn register_worker(index: usize) {
        WORKER_INDEX.set(Some(index));
    }

    fn record(span: Span, start: Instant, duration: Duration) {
        let event = Event {
            span,
            worker: WORKER_INDEX.get(),
            start_us: COLLECTOR.epoch_unix_us
                + start.saturating_duration_since(COLLECTOR.epoch).as_micros() as u64,
            duration_us: duration.as_micros() as u64,
        };
        LOCAL_EVENTS.with(|events| events.borrow_mut().push(event));
    }

    /// Hands the calling thread's buffered events to the collector.
    /// Workers flush as they exit; any other thread that recorded events
    /// must flush before [`export_to_file`] will see them.
    pub fn flush_thread() {
        LOCAL_EVENTS.with(|events| {
            let mut local = events.borrow_mut();
            if !local.is_empty() {
                COLLECTOR.merged.lock().unwrap().append(&mut local);
            }
        });
    }

    /// Writes every flushed event as a Chrome Tracing complete-event array.
    /// Worker lanes become tids; fiber spans carry the fiber id in `args`.
    pub fn export_to_file(path: &str) -> std::io::Result<()> {
        let merged = COLLECTOR.merged.lock().unwrap();
        let mut writer = BufWriter::new(File::create(path)?);

        writer.write_all(b"[")?;
        for (i, event) in merged.iter().enumerate() {
            if i > 0 {
                writer.write_all(b",")?;
            }
            let tid = event.worker.unwrap_or(OUTSIDE_LANE);
            match &event.span {
                Span::Zone(zone) => write!(
                    writer,
                    "\n{{\"name\":\"{}\",\"cat\":\"zone\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
                    zone.label(),
                    event.start_us,
                    event.duration_us,
                    tid
                )?,
                Span::Fiber(fiber) => write!(
                    writer,
                    "\n{{\"name\":\"Fiber\",\"cat\":\"fiber\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{},\"args\":{{\"fiber\":{}}}}}",
                    event.start_us,
                    event.duration_us,
                    tid,
                    fiber.as_usize()
                )?,
            }
        }
        writer.write_all(b"\n]\n")?;
        writer.flush()
    }

    /// Span guard for a dispatch phase; records on drop. A guard that
    /// crosses a fiber migration records into the thread it drops on.
    pub struct ZoneGuard {
        zone: Zone,
        start: Instant,
    }

    impl ZoneGuard {
        pub fn new(zone: Zone) -> ZoneGuard {
            ZoneGuard {
                zone,
                start: Instant::now(),
            }
        }
    }

    impl Drop for ZoneGuard {
        fn drop(&mut self) {
            record(Span::Zone(self.zone), self.start, self.start.elapsed());
        }
    }

    /// Span guard for one fiber occupying a worker between two switches.
    pub struct FiberSpan {
        fiber: FiberId,
        start: Instant,
    }

    impl FiberSpan {
        pub fn new(fiber: FiberId) -> FiberSpan {
            FiberSpan {
                fiber,
                start: Instant::now(),
            }
        }
    }

    impl Drop for FiberSpan {
        fn drop(&mut self) {
            record(Span::Fiber(self.fiber), self.start, self.start.elapsed());
        }
    }

}

#[cfg(feature = "trace")]
pub use imp::*;

#[cfg(feature = "trace")]
macro_rules! zone {
    ($zone:ident) => {
        let _zone = $crate::trace::ZoneGuard::new($crate::trace::Zone::$zone);
    };
}

#[cfg(not(feature = "trace"))]
macro_rules! zone {
    ($zone:ident) => {};
}

pub(crate) use zone;

#[cfg(feature = "trace")]
macro_rules! fiber_span {
    ($fiber:expr) => {
        let _span = $crate::trace::FiberSpan::new($fiber);
    };
}

#[cfg(not(feature = "trace"))]
macro_rules! fiber_span {
    ($fiber:expr) => {};
}

pub(crate) use fiber_span;
