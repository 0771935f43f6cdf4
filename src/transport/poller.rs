//! Duty-cycle thread.
//!
//! One dedicated thread per poller runs, in order, every iteration:
//!
//! 1. pending commands (new/removed subscriptions, new duties)
//! 2. tasks handed over by [`Scheduler`]s, into the timer wheel
//! 3. every open subscription: poll, reassemble, decode, dispatch
//! 4. every [`Duty`]
//! 5. timer wheel expiry
//! 6. the idle strategy, fed with the work done above
//!
//! Each subscription poll, duty and timer task runs inside its own
//! `catch_unwind`, so one failing stream is logged and skipped while the
//! others keep being served. Errors never stop the loop; only
//! [`PollerHandle::shutdown`] does, between iterations.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::assembler::FragmentAssembler;
use super::envelope::{self, Envelope};
use super::idle::BackoffIdleStrategy;
use super::timer::{ScheduledTaskQueue, Scheduler, TimerTask, TimerWheel};
use crate::core::{PollerConfig, PollerError, SessionId, SubstrateError};
use crate::substrate::{ImageInfo, ImageListener, MediaDriver, Subscription};

/// Receiver of decoded envelopes from one subscription.
///
/// Called on the poller thread only.
pub trait EnvelopeHandler: Send + Sync {
    /// One complete, decoded envelope from the image of `session`.
    fn on_envelope(&self, session: SessionId, envelope: Envelope<'_>);
}

/// Housekeeping run once per duty cycle.
pub trait Duty: Send {
    /// Do pending work; return how much was done (0 when idle).
    fn do_work(&mut self) -> usize;

    /// Name used in logs.
    fn name(&self) -> &str {
        "duty"
    }
}

/// Identifier of a subscription registered with a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Command {
    AddSubscription(Box<PolledSubscription>),
    RemoveSubscription(SubscriptionId),
    AddDuty(Box<dyn Duty>),
}

/// Forwards image events and remembers lost sessions so their partial
/// fragments can be dropped.
struct ImageTracker {
    inner: Arc<dyn ImageListener>,
    lost: Arc<Mutex<Vec<SessionId>>>,
}

impl ImageListener for ImageTracker {
    fn on_available_image(&self, image: &ImageInfo) {
        self.inner.on_available_image(image);
    }

    fn on_unavailable_image(&self, image: &ImageInfo) {
        self.lost.lock().push(image.session_id);
        self.inner.on_unavailable_image(image);
    }
}

struct PolledSubscription {
    id: SubscriptionId,
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn EnvelopeHandler>,
    assembler: FragmentAssembler,
    lost: Arc<Mutex<Vec<SessionId>>>,
}

impl PolledSubscription {
    fn poll(&mut self, limit: usize) -> Result<usize, SubstrateError> {
        let Self {
            subscription,
            handler,
            assembler,
            lost,
            ..
        } = self;

        let fragments = subscription.poll(
            &mut |data, header| {
                let assembled = assembler.on_fragment(data, header, |session, message| {
                    match envelope::decode(message) {
                        Ok(envelope) => handler.on_envelope(session, envelope),
                        Err(e) => {
                            warn!(session = %session, error = %e, "dropping malformed envelope")
                        }
                    }
                });
                if let Err(e) = assembled {
                    warn!(error = %e, "fragment reassembly failed");
                }
            },
            limit,
        )?;

        for session in lost.lock().drain(..) {
            assembler.remove_session(session);
        }
        Ok(fragments)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// The duty-cycle state, owned by its thread.
pub struct Poller {
    config: PollerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    scheduled: ScheduledTaskQueue,
    subscriptions: Vec<PolledSubscription>,
    duties: Vec<Box<dyn Duty>>,
    wheel: TimerWheel<TimerTask>,
    idle: BackoffIdleStrategy,
    shutdown: Arc<AtomicBool>,
}

impl Poller {
    /// Validate `config` and start the duty-cycle thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    pub fn start(config: PollerConfig) -> Result<PollerHandle, PollerError> {
        config.validate()?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (scheduler, scheduled) = Scheduler::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let wheel = TimerWheel::new(config.timer_tick, config.timer_buckets)?;
        let thread_name = config.thread_name.clone();
        let max_message_length = config.max_message_length;

        let poller = Poller {
            idle: BackoffIdleStrategy::new(config.idle),
            config,
            commands,
            scheduled,
            subscriptions: Vec::new(),
            duties: Vec::new(),
            wheel,
            shutdown: Arc::clone(&shutdown),
        };

        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!("poller thread started");
                let mut poller = poller;
                poller.run();
                info!("poller thread exiting");
            })
            .expect("failed to spawn poller thread");

        Ok(PollerHandle {
            commands: command_tx,
            scheduler,
            shutdown,
            thread: Some(thread),
            thread_name,
            max_message_length,
            next_subscription: AtomicU64::new(1),
        })
    }

    fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let work = self.do_work();
            self.idle.idle(work);
        }

        for entry in self.subscriptions.drain(..) {
            entry.subscription.close();
        }
    }

    /// One duty cycle. Returns the work done.
    fn do_work(&mut self) -> usize {
        let mut work = self.apply_commands();
        work += self.drain_scheduled();
        work += self.poll_subscriptions();
        work += self.run_duties();
        work += self.expire_timers();
        work
    }

    fn apply_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.commands.try_recv() {
            applied += 1;
            match command {
                Command::AddSubscription(entry) => {
                    debug!(channel = entry.subscription.channel(), stream_id = entry.subscription.stream_id(), "subscription added");
                    self.subscriptions.push(*entry);
                }
                Command::RemoveSubscription(id) => {
                    self.subscriptions.retain(|entry| {
                        if entry.id == id {
                            entry.subscription.close();
                            false
                        } else {
                            true
                        }
                    });
                }
                Command::AddDuty(duty) => {
                    debug!(duty = duty.name(), "duty added");
                    self.duties.push(duty);
                }
            }
        }
        applied
    }

    fn drain_scheduled(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(task) = self.scheduled.try_recv() {
            self.wheel.insert(task.deadline, task.token, task.task);
            drained += 1;
        }
        drained
    }

    fn poll_subscriptions(&mut self) -> usize {
        let limit = match self.config.fragment_limit {
            0 => usize::MAX,
            limit => limit,
        };

        let mut work = 0;
        for entry in self.subscriptions.iter_mut() {
            if entry.subscription.is_closed() {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| entry.poll(limit))) {
                Ok(Ok(fragments)) => work += fragments,
                Ok(Err(e)) => {
                    warn!(channel = entry.subscription.channel(), error = %e, "subscription poll failed")
                }
                Err(payload) => {
                    warn!(channel = entry.subscription.channel(), panic = panic_message(payload.as_ref()), "subscription poll panicked")
                }
            }
        }

        self.subscriptions.retain(|entry| {
            let closed = entry.subscription.is_closed();
            if closed {
                debug!(channel = entry.subscription.channel(), "dropping closed subscription");
            }
            !closed
        });
        work
    }

    fn run_duties(&mut self) -> usize {
        let mut work = 0;
        for duty in self.duties.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| duty.do_work())) {
                Ok(done) => work += done,
                Err(payload) => {
                    warn!(duty = duty.name(), panic = panic_message(payload.as_ref()), "duty panicked")
                }
            }
        }
        work
    }

    fn expire_timers(&mut self) -> usize {
        let now = Instant::now();
        if !self.wheel.is_due(now) {
            return 0;
        }
        let fired = self.wheel.expire(now, |task| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                warn!(panic = panic_message(payload.as_ref()), "timer task panicked");
            }
        });
        if fired > 0 {
            trace!(fired, "timers expired");
        }
        fired
    }
}

/// Owner's handle to a running poller.
///
/// Dropping the handle signals the thread to stop without waiting for it.
pub struct PollerHandle {
    commands: mpsc::UnboundedSender<Command>,
    scheduler: Scheduler,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    thread_name: String,
    max_message_length: usize,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("thread_name", &self.thread_name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PollerHandle {
    /// Subscribe to `channel`/`stream_id` and poll it on this poller.
    ///
    /// Image events go to `listener`, decoded envelopes to `handler`. Both
    /// run on the poller thread.
    pub fn add_subscription(
        &self,
        driver: &dyn MediaDriver,
        channel: &str,
        stream_id: i32,
        listener: Arc<dyn ImageListener>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionId, PollerError> {
        if !self.is_running() {
            return Err(PollerError::Stopped);
        }

        let lost = Arc::new(Mutex::new(Vec::new()));
        let tracker = Arc::new(ImageTracker {
            inner: listener,
            lost: Arc::clone(&lost),
        });
        let subscription = driver.add_subscription(channel, stream_id, tracker)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        let entry = PolledSubscription {
            id,
            subscription: Arc::clone(&subscription),
            handler,
            assembler: FragmentAssembler::new(self.max_message_length),
            lost,
        };
        if self
            .commands
            .send(Command::AddSubscription(Box::new(entry)))
            .is_err()
        {
            subscription.close();
            return Err(PollerError::Stopped);
        }
        self.wake();
        Ok(id)
    }

    /// Stop polling and close a subscription.
    pub fn remove_subscription(&self, id: SubscriptionId) -> Result<(), PollerError> {
        self.commands
            .send(Command::RemoveSubscription(id))
            .map_err(|_| PollerError::Stopped)?;
        self.wake();
        Ok(())
    }

    /// Run `duty` every duty cycle.
    pub fn add_duty<D: Duty + 'static>(&self, duty: D) -> Result<(), PollerError> {
        self.commands
            .send(Command::AddDuty(Box::new(duty)))
            .map_err(|_| PollerError::Stopped)?;
        self.wake();
        Ok(())
    }

    /// Scheduler for this poller's timer wheel.
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Name of the duty-cycle thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// The thread is still running.
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    /// Stop the thread after its current iteration and wait for it.
    pub fn shutdown(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(thread = %self.thread_name, "poller thread panicked");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;
    use crate::substrate::memory::MemoryDriver;
    use crate::transport::envelope::{MessageKind, encode};

    const CHANNEL: &str = "udp://127.0.0.1:40555";
    const WAIT: Duration = Duration::from_secs(5);

    struct NoImages;

    impl ImageListener for NoImages {
        fn on_available_image(&self, _: &ImageInfo) {}
        fn on_unavailable_image(&self, _: &ImageInfo) {}
    }

    struct Forward(Mutex<std_mpsc::Sender<(SessionId, MessageKind, Vec<u8>)>>);

    impl EnvelopeHandler for Forward {
        fn on_envelope(&self, session: SessionId, envelope: Envelope<'_>) {
            let _ = self
                .0
                .lock()
                .send((session, envelope.kind, envelope.payload.to_vec()));
        }
    }

    struct Explode;

    impl EnvelopeHandler for Explode {
        fn on_envelope(&self, _: SessionId, _: Envelope<'_>) {
            panic!("handler failure");
        }
    }

    fn forward() -> (
        Arc<Forward>,
        std_mpsc::Receiver<(SessionId, MessageKind, Vec<u8>)>,
    ) {
        let (tx, rx) = std_mpsc::channel();
        (Arc::new(Forward(Mutex::new(tx))), rx)
    }

    #[test]
    fn test_dispatches_envelopes() {
        let driver = MemoryDriver::with_mtu(8);
        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        let (handler, rx) = forward();
        poller
            .add_subscription(&driver, CHANNEL, 1, Arc::new(NoImages), handler)
            .unwrap();

        let publication = driver.add_publication(CHANNEL, 1).unwrap();
        let message = encode(MessageKind::Frame, 0, b"a message longer than the mtu");
        while publication.offer(&message).is_err() {
            thread::yield_now();
        }

        let (session, kind, payload) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(session, publication.session_id());
        assert_eq!(kind, MessageKind::Frame);
        assert_eq!(payload, b"a message longer than the mtu");
        poller.shutdown();
    }

    #[test]
    fn test_malformed_envelope_skipped() {
        let driver = MemoryDriver::new();
        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        let (handler, rx) = forward();
        poller
            .add_subscription(&driver, CHANNEL, 1, Arc::new(NoImages), handler)
            .unwrap();

        let publication = driver.add_publication(CHANNEL, 1).unwrap();
        while publication.offer(&[0xFF]).is_err() {
            thread::yield_now();
        }
        publication
            .offer(&encode(MessageKind::Frame, 1, b"ok"))
            .unwrap();

        let (_, _, payload) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(payload, b"ok");
        poller.shutdown();
    }

    #[test]
    fn test_panicking_subscription_isolated() {
        let driver = MemoryDriver::new();
        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        poller
            .add_subscription(&driver, CHANNEL, 1, Arc::new(NoImages), Arc::new(Explode))
            .unwrap();
        let (handler, rx) = forward();
        poller
            .add_subscription(&driver, CHANNEL, 2, Arc::new(NoImages), handler)
            .unwrap();

        let bad = driver.add_publication(CHANNEL, 1).unwrap();
        let good = driver.add_publication(CHANNEL, 2).unwrap();
        let frame = encode(MessageKind::Frame, 0, b"still alive");
        while bad.offer(&frame).is_err() {
            thread::yield_now();
        }
        bad.offer(&frame).unwrap();
        while good.offer(&frame).is_err() {
            thread::yield_now();
        }

        let (_, _, payload) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(payload, b"still alive");
        assert!(poller.is_running());
        poller.shutdown();
    }

    #[test]
    fn test_scheduled_tasks_run() {
        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        let scheduler = poller.scheduler();
        let (tx, rx) = std_mpsc::channel();

        let cancelled_tx = tx.clone();
        let token = scheduler.schedule_after(Duration::from_millis(5), move || {
            let _ = cancelled_tx.send("cancelled");
        });
        token.cancel();
        scheduler.schedule_after(Duration::from_millis(1), || panic!("timer failure"));
        scheduler.schedule_after(Duration::from_millis(10), move || {
            let _ = tx.send("fired");
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fired");
        assert!(rx.try_recv().is_err());
        poller.shutdown();
    }

    #[test]
    fn test_duties_run() {
        struct Counter(Arc<AtomicUsize>);

        impl Duty for Counter {
            fn do_work(&mut self) -> usize {
                self.0.fetch_add(1, Ordering::SeqCst);
                0
            }
        }

        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        poller.add_duty(Counter(Arc::clone(&count))).unwrap();

        let deadline = Instant::now() + WAIT;
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
        poller.shutdown();
    }

    #[test]
    fn test_shutdown_closes_subscriptions() {
        let driver = MemoryDriver::new();
        let poller = Poller::start(PollerConfig::named("test-poller")).unwrap();
        poller
            .add_subscription(&driver, CHANNEL, 3, Arc::new(NoImages), forward().0)
            .unwrap();
        let publication = driver.add_publication(CHANNEL, 3).unwrap();
        while !publication.is_connected() {
            thread::yield_now();
        }

        poller.shutdown();
        assert!(!publication.is_connected());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PollerConfig {
            timer_buckets: 3,
            ..PollerConfig::named("test-poller")
        };
        assert!(matches!(
            Poller::start(config),
            Err(PollerError::Config(_))
        ));
    }
}
