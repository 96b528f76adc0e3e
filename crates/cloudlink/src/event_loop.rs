use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use indexmap::IndexMap;

use tokio::sync::Notify;
use tokio::time::Instant;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use crate::error::Result;

/// A handler run by the [`EventLoop`].
///
/// It receives the loop context and a [`Scheduler`] used to register,
/// re-arm or remove sources. Changes made through the [`Scheduler`] take
/// effect on the next loop turn.
pub type Handler<C> = Box<dyn FnMut(&mut C, &mut Scheduler<C>) -> Result<()>>;

/// An identifier of a source registered on the [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceHandle(u64);

/// A readiness interest mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Readable readiness.
    pub const READABLE: Self = Self(0b01);
    /// Writable readiness.
    pub const WRITABLE: Self = Self(0b10);

    /// Returns the union of two interests.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Checks whether two interests share at least one readiness kind.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug)]
struct IoState {
    pending: AtomicU8,
    wakeup: Arc<Notify>,
}

/// A readiness descriptor bound to an [`EventLoop`].
///
/// Any thread or task can signal it; the handlers registered on it run on
/// the loop thread during the next turn.
#[derive(Debug, Clone)]
pub struct IoSource(Arc<IoState>);

impl IoSource {
    /// Marks the source as ready for the given [`Interest`] and wakes the
    /// loop up.
    pub fn signal(&self, interest: Interest) {
        let _ = self.0.pending.fetch_or(interest.0, Ordering::AcqRel);
        self.0.wakeup.notify_one();
    }

    fn is_ready(&self, interest: Interest) -> bool {
        self.0.pending.load(Ordering::Acquire) & interest.0 != 0
    }

    fn take(&self, interest: Interest) -> bool {
        self.0.pending.fetch_and(!interest.0, Ordering::AcqRel) & interest.0 != 0
    }
}

enum Trigger {
    Periodic(Duration),
    Once,
    Io(IoSource, Interest),
}

struct Source<C> {
    trigger: Trigger,
    deadline: Option<Duration>,
    handler: Handler<C>,
}

impl<C> Source<C> {
    fn is_due(&self, now: Duration) -> bool {
        match &self.trigger {
            Trigger::Io(source, interest) => source.is_ready(*interest),
            Trigger::Periodic(_) | Trigger::Once => self.deadline.is_some_and(|d| d <= now),
        }
    }
}

enum Change<C> {
    Insert(SourceHandle, Source<C>),
    SetPeriod(SourceHandle, Duration),
    Remove(SourceHandle),
}

/// Registers, re-arms and removes [`EventLoop`] sources.
///
/// Within a handler, every change is queued and applied once the current
/// turn is over.
pub struct Scheduler<C> {
    now: Duration,
    next_handle: u64,
    changes: Vec<Change<C>>,
    stop: CancellationToken,
    wakeup: Arc<Notify>,
}

impl<C> Scheduler<C> {
    fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_handle: 0,
            changes: Vec::new(),
            stop: CancellationToken::new(),
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Returns the loop time of the current turn.
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Registers a periodic timer.
    ///
    /// A zero period registers the timer disarmed.
    pub fn periodic<F>(&mut self, period: Duration, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        let deadline = (!period.is_zero()).then(|| self.now + period);
        self.insert(Trigger::Periodic(period), deadline, Box::new(handler))
    }

    /// Registers a one-shot timer.
    ///
    /// Once fired, the timer is removed unless its handler re-arms it
    /// through [`Scheduler::set_period`].
    pub fn once<F>(&mut self, delay: Duration, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        let deadline = Some(self.now + delay);
        self.insert(Trigger::Once, deadline, Box::new(handler))
    }

    /// Registers a handler run whenever the [`IoSource`] is signalled with
    /// the given [`Interest`].
    pub fn register_io<F>(&mut self, source: &IoSource, interest: Interest, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        self.insert(
            Trigger::Io(source.clone(), interest),
            None,
            Box::new(handler),
        )
    }

    /// Changes the period of a timer.
    ///
    /// A zero period disarms the timer, any other value re-arms it
    /// `period` after the current loop time.
    pub fn set_period(&mut self, handle: SourceHandle, period: Duration) {
        self.changes.push(Change::SetPeriod(handle, period));
    }

    /// Removes a source.
    pub fn unregister(&mut self, handle: SourceHandle) {
        self.changes.push(Change::Remove(handle));
    }

    /// Requests the loop to stop at the end of the current turn.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Checks whether a stop has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn insert(
        &mut self,
        trigger: Trigger,
        deadline: Option<Duration>,
        handler: Handler<C>,
    ) -> SourceHandle {
        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;
        self.changes.push(Change::Insert(
            handle,
            Source {
                trigger,
                deadline,
                handler,
            },
        ));
        handle
    }
}

/// A single-threaded cooperative event loop.
///
/// Handlers run to completion, in registration order, against an explicitly
/// owned context `C`. A handler returning an error is logged and the loop
/// goes on; a handler stops the loop through [`Scheduler::request_stop`].
pub struct EventLoop<C> {
    sources: IndexMap<SourceHandle, Source<C>>,
    scheduler: Scheduler<C>,
}

impl<C> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventLoop<C> {
    /// Creates an empty [`EventLoop`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: IndexMap::new(),
            scheduler: Scheduler::new(),
        }
    }

    /// Creates an [`IoSource`] bound to this loop.
    #[must_use]
    pub fn io_source(&self) -> IoSource {
        IoSource(Arc::new(IoState {
            pending: AtomicU8::new(0),
            wakeup: Arc::clone(&self.scheduler.wakeup),
        }))
    }

    /// Returns the token which stops the loop once cancelled.
    ///
    /// The token can be cancelled from any thread, for example from a
    /// signal handling task.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.scheduler.stop.clone()
    }

    /// Registers a periodic timer. See [`Scheduler::periodic`].
    pub fn periodic<F>(&mut self, period: Duration, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        let handle = self.scheduler.periodic(period, handler);
        self.apply_changes();
        handle
    }

    /// Registers a one-shot timer. See [`Scheduler::once`].
    pub fn once<F>(&mut self, delay: Duration, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        let handle = self.scheduler.once(delay, handler);
        self.apply_changes();
        handle
    }

    /// Registers an I/O readiness handler. See [`Scheduler::register_io`].
    pub fn register_io<F>(&mut self, source: &IoSource, interest: Interest, handler: F) -> SourceHandle
    where
        F: FnMut(&mut C, &mut Scheduler<C>) -> Result<()> + 'static,
    {
        let handle = self.scheduler.register_io(source, interest, handler);
        self.apply_changes();
        handle
    }

    /// Changes the period of a timer. See [`Scheduler::set_period`].
    pub fn set_period(&mut self, handle: SourceHandle, period: Duration) {
        self.scheduler.set_period(handle, period);
        self.apply_changes();
    }

    /// Removes a source.
    pub fn unregister(&mut self, handle: SourceHandle) {
        self.scheduler.unregister(handle);
        self.apply_changes();
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Checks whether no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Checks whether a timer is registered and armed.
    #[must_use]
    pub fn is_armed(&self, handle: SourceHandle) -> bool {
        self.sources
            .get(&handle)
            .is_some_and(|source| source.deadline.is_some())
    }

    /// Returns the earliest armed timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.sources
            .values()
            .filter_map(|source| source.deadline)
            .min()
    }

    /// Runs a single dispatch pass at the given loop time and returns the
    /// number of handlers which have been run.
    pub fn turn(&mut self, ctx: &mut C, now: Duration) -> usize {
        self.scheduler.now = now;

        let due: Vec<SourceHandle> = self
            .sources
            .iter()
            .filter(|(_, source)| source.is_due(now))
            .map(|(handle, _)| *handle)
            .collect();

        let mut fired_once = Vec::new();
        let mut dispatched = 0;
        for handle in due {
            if self.scheduler.is_stopping() {
                break;
            }

            let Some(source) = self.sources.get_mut(&handle) else {
                continue;
            };

            match &source.trigger {
                Trigger::Periodic(period) => {
                    let next = source.deadline.map_or(now, |d| d + *period);
                    source.deadline = Some(if next <= now { now + *period } else { next });
                }
                Trigger::Once => {
                    source.deadline = None;
                    fired_once.push(handle);
                }
                Trigger::Io(io, interest) => {
                    if !io.take(*interest) {
                        continue;
                    }
                }
            }

            if let Err(e) = (source.handler)(ctx, &mut self.scheduler) {
                error!("Event loop handler failed, continuing: {e}");
            }
            dispatched += 1;
        }

        self.apply_changes();

        // One-shot timers which have not been re-armed by their handler are
        // done.
        for handle in fired_once {
            if self
                .sources
                .get(&handle)
                .is_some_and(|source| source.deadline.is_none())
            {
                let _ = self.sources.shift_remove(&handle);
            }
        }

        dispatched
    }

    /// Runs the loop until a stop is requested.
    pub async fn run(&mut self, ctx: &mut C) {
        let start = Instant::now();
        let stop = self.scheduler.stop.clone();
        let wakeup = Arc::clone(&self.scheduler.wakeup);

        while !stop.is_cancelled() {
            let _ = self.turn(ctx, start.elapsed());
            if stop.is_cancelled() {
                break;
            }

            let deadline = self.next_deadline().map(|d| start + d);
            tokio::select! {
                // Use the cancellation token to stop the loop
                () = stop.cancelled() => { break; }
                // An I/O source has been signalled
                () = wakeup.notified() => {}
                // The earliest timer is due
                () = sleep_until(deadline) => {}
            }
        }

        debug!("Event loop stopped");
    }

    fn apply_changes(&mut self) {
        let now = self.scheduler.now;
        for change in self.scheduler.changes.drain(..) {
            match change {
                Change::Insert(handle, source) => {
                    let _ = self.sources.insert(handle, source);
                }
                Change::SetPeriod(handle, period) => {
                    let Some(source) = self.sources.get_mut(&handle) else {
                        warn!("Cannot change the period of an unknown source");
                        continue;
                    };
                    match &mut source.trigger {
                        Trigger::Periodic(current) => *current = period,
                        Trigger::Once => {}
                        Trigger::Io(..) => {
                            warn!("An I/O source has no period");
                            continue;
                        }
                    }
                    source.deadline = (!period.is_zero()).then(|| now + period);
                }
                Change::Remove(handle) => {
                    let _ = self.sources.shift_remove(&handle);
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::{Error, ErrorKind};

    use super::{EventLoop, Interest, SourceHandle};

    #[derive(Default)]
    struct Counters {
        ticks: u32,
        once: u32,
        io: u32,
        disarm: Option<SourceHandle>,
    }

    const PERIOD: Duration = Duration::from_millis(100);

    fn millis(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn periodic_timer() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let handle = event_loop.periodic(PERIOD, |c, _| {
            c.ticks += 1;
            Ok(())
        });
        assert!(event_loop.is_armed(handle));
        assert_eq!(event_loop.next_deadline(), Some(PERIOD));

        assert_eq!(event_loop.turn(&mut counters, millis(0)), 0);
        assert_eq!(event_loop.turn(&mut counters, millis(100)), 1);
        assert_eq!(event_loop.turn(&mut counters, millis(150)), 0);
        assert_eq!(event_loop.turn(&mut counters, millis(200)), 1);
        assert_eq!(counters.ticks, 2);

        // A late turn does not replay the missed periods.
        assert_eq!(event_loop.turn(&mut counters, millis(1000)), 1);
        assert_eq!(event_loop.next_deadline(), Some(millis(1100)));
    }

    #[test]
    fn one_shot_timer() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let _ = event_loop.once(millis(300), |c, _| {
            c.once += 1;
            Ok(())
        });

        let _ = event_loop.turn(&mut counters, millis(299));
        assert_eq!(counters.once, 0);
        let _ = event_loop.turn(&mut counters, millis(300));
        let _ = event_loop.turn(&mut counters, millis(900));
        assert_eq!(counters.once, 1);
        assert!(event_loop.is_empty());
    }

    #[test]
    fn zero_period_disarms() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let handle = event_loop.periodic(PERIOD, |c, scheduler| {
            c.ticks += 1;
            if let Some(handle) = c.disarm.take() {
                scheduler.set_period(handle, Duration::ZERO);
            }
            Ok(())
        });
        counters.disarm = Some(handle);

        let _ = event_loop.turn(&mut counters, millis(100));
        assert!(!event_loop.is_armed(handle));
        let _ = event_loop.turn(&mut counters, millis(200));
        assert_eq!(counters.ticks, 1);

        // Re-arm from outside the loop.
        event_loop.set_period(handle, millis(50));
        let _ = event_loop.turn(&mut counters, millis(250));
        assert_eq!(counters.ticks, 2);
    }

    #[test]
    fn registration_inside_handler_applies_next_turn() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let _ = event_loop.once(Duration::ZERO, |_, scheduler| {
            let _ = scheduler.once(Duration::ZERO, |c: &mut Counters, _| {
                c.once += 1;
                Ok(())
            });
            Ok(())
        });

        assert_eq!(event_loop.turn(&mut counters, millis(0)), 1);
        assert_eq!(counters.once, 0);
        assert_eq!(event_loop.turn(&mut counters, millis(0)), 1);
        assert_eq!(counters.once, 1);
    }

    #[test]
    fn io_readiness() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let source = event_loop.io_source();
        let _ = event_loop.register_io(&source, Interest::READABLE, |c, _| {
            c.io += 1;
            Ok(())
        });

        assert_eq!(event_loop.turn(&mut counters, millis(0)), 0);

        // A writable signal does not match the readable interest.
        source.signal(Interest::WRITABLE);
        assert_eq!(event_loop.turn(&mut counters, millis(1)), 0);

        source.signal(Interest::READABLE | Interest::WRITABLE);
        assert_eq!(event_loop.turn(&mut counters, millis(2)), 1);
        assert_eq!(event_loop.turn(&mut counters, millis(3)), 0);
        assert_eq!(counters.io, 1);
    }

    #[test]
    fn failing_handler_does_not_stop_the_loop() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let _ = event_loop.periodic(PERIOD, |_, _| {
            Err(Error::new(ErrorKind::Transport, "Broken handler"))
        });
        let _ = event_loop.periodic(PERIOD, |c, _| {
            c.ticks += 1;
            Ok(())
        });

        assert_eq!(event_loop.turn(&mut counters, millis(100)), 2);
        assert_eq!(counters.ticks, 1);
    }

    #[test]
    fn unregister_source() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let handle = event_loop.periodic(PERIOD, |c, _| {
            c.ticks += 1;
            Ok(())
        });
        event_loop.unregister(handle);
        assert!(event_loop.is_empty());
        assert_eq!(event_loop.turn(&mut counters, millis(100)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_stopped() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let _ = event_loop.periodic(PERIOD, |c, scheduler| {
            c.ticks += 1;
            if c.ticks == 5 {
                scheduler.request_stop();
            }
            Ok(())
        });

        event_loop.run(&mut counters).await;
        assert_eq!(counters.ticks, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_token_from_another_task() {
        let mut event_loop = EventLoop::<Counters>::new();
        let mut counters = Counters::default();

        let _ = event_loop.periodic(PERIOD, |c, _| {
            c.ticks += 1;
            Ok(())
        });

        let token = event_loop.stop_token();
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            token.cancel();
        });

        event_loop.run(&mut counters).await;
        assert_eq!(counters.ticks, 3);
    }
}
