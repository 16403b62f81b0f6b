//! Timers
use alloc::boxed::Box;
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        BadParamError, CreateError, DeleteError, KillError, QueryError, SetTimerParamError,
        UpdateError, WaitError, WaitObjectError,
    },
    klock::{lock_cpu, CpuLockGuard},
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Ticks, Timeout, TimeoutTarget, HEAP_POS_NONE},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

/// The identifier of a timer.
pub(crate) type TimerId = Id;

define_object_handle! {
    /// Represents a single timer in a system.
    ///
    /// An active timer fires after its *delay* elapses, calling its callback
    /// function in an interrupt context. A periodic timer keeps firing every
    /// *period*, measured from the previous scheduled firing time so that
    /// late ticks don't accumulate drift.
    pub struct Timer;
}

/// *Timer control block* - the state data of a timer.
pub(crate) struct TimerCb {
    callback: Option<Box<dyn FnMut() + Send>>,

    /// The delay from [`Timer::start`] to the first firing. `None` means the
    /// timer never fires.
    delay: Option<Ticks>,

    /// The interval between firings. `None` means the timer is one-shot.
    period: Option<Ticks>,

    active: bool,

    /// `true` while the callback is running (and thus has been moved out of
    /// `callback`).
    firing: bool,

    /// The position of the timer's timeout in the timeout heap.
    pub(crate) heap_pos: usize,

    /// The tasks waiting for the next firing.
    wait_queue: WaitQueueId,
}

impl fmt::Debug for TimerCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("delay", &self.delay)
            .field("period", &self.period)
            .field("active", &self.active)
            .field("firing", &self.firing)
            .field("heap_pos", &self.heap_pos)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// The builder for [`Timer`], created by [`Timer::define`].
#[must_use = "call `finish` to create a timer"]
pub struct TimerDefiner<Traits> {
    callback: Option<Box<dyn FnMut() + Send>>,
    delay: Option<Ticks>,
    period: Option<Ticks>,
    active: bool,
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Construct a `TimerDefiner` to define a timer.
    pub fn define() -> TimerDefiner<Traits> {
        TimerDefiner {
            callback: None,
            delay: None,
            period: None,
            active: false,
            _phantom: PhantomData,
        }
    }

    /// Start the timer. The timer fires after its delay elapses.
    ///
    /// If the timer is already active, it's restarted.
    pub fn start(self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.timers.cb(self.0)?;
        start_timer::<Traits>(g, self.0);
        Ok(())
    }

    /// Stop the timer.
    pub fn stop(self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.timers.cb(self.0)?;
        stop_timer(g, self.0);
        Ok(())
    }

    /// Set the delay before the next firing. If the timer is active, the
    /// new delay is measured from now.
    pub fn set_delay(self, delay: Option<Ticks>) -> Result<(), SetTimerParamError> {
        let delay = delay.map(timeout::validate_duration).transpose()?;

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let timer_cb = g.timers.cb_mut(self.0)?;
        timer_cb.delay = delay;
        if timer_cb.active {
            start_timer::<Traits>(g, self.0);
        }
        Ok(())
    }

    /// Set the interval between firings. The change takes effect when the
    /// timer is re-armed next time.
    pub fn set_period(self, period: Option<Ticks>) -> Result<(), SetTimerParamError> {
        let period = validate_period(period)?;

        let mut lock = lock_cpu::<Traits>()?;
        globals(&mut *lock).timers.cb_mut(self.0)?.period = period;
        Ok(())
    }

    /// Get a flag indicating whether the timer is active.
    pub fn is_active(self) -> Result<bool, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).timers.cb(self.0)?.active)
    }

    /// Block the current task until the timer fires next time.
    pub fn wait(self, timeout: Timeout) -> Result<(), WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let wait_queue = g.timers.cb(self.0)?.wait_queue;

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        state::expect_waitable_context::<Traits>()?;
        let (_, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::Timer,
            deadline,
        );
        Ok(result?)
    }

    /// Stop the timer and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.timers.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the timer and free its id.
    ///
    /// A timer can delete itself from its callback.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.timers.cb(self.0)?;
        kill_inner(g, self.0);
        let timer_cb = g.timers.remove_cb(self.0)?;
        wait::free_wait_queue(g, timer_cb.wait_queue);
        log::debug!("deleted timer {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);

        // The callback (if any) is dropped here, outside the critical section
        drop(timer_cb);
        Ok(())
    }
}

impl<Traits: KernelTraits> TimerDefiner<Traits> {
    /// Specify the callback function called when the timer fires.
    pub fn callback(self, callback: impl FnMut() + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            ..self
        }
    }

    /// Specify the delay from [`Timer::start`] to the first firing.
    /// Defaults to `None` (never fires).
    pub fn delay(self, delay: Ticks) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Specify the interval between firings. Defaults to `None` (one-shot).
    pub fn period(self, period: Ticks) -> Self {
        Self {
            period: Some(period),
            ..self
        }
    }

    /// Specify whether the timer should be started on creation. Defaults to
    /// `false`.
    pub fn active(self, active: bool) -> Self {
        Self { active, ..self }
    }

    /// Create the timer.
    pub fn finish(self) -> Result<Timer<Traits>, CreateError> {
        let delay = self.delay.map(timeout::validate_duration).transpose()?;
        let period = validate_period(self.period)?;

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let timer = g.timers.insert_cb(TimerCb {
            callback: self.callback,
            delay,
            period,
            active: false,
            firing: false,
            heap_pos: HEAP_POS_NONE,
            wait_queue,
        });

        log::debug!(
            "created timer {:?} (delay {:?}, period {:?})",
            timer,
            delay,
            period
        );

        if self.active {
            start_timer::<Traits>(g, timer);
        }

        Ok(Timer::from_id(timer))
    }
}

fn validate_period(period: Option<Ticks>) -> Result<Option<Ticks>, BadParamError> {
    match period {
        Some(0) => Err(BadParamError::BadParam),
        Some(period) => timeout::validate_duration(period).map(Some),
        None => Ok(None),
    }
}

/// Arm (or re-arm) the timer to fire after its delay.
fn start_timer<Traits: KernelTraits>(g: &mut Globals, timer: TimerId) {
    timeout::remove_timeout(g, TimeoutTarget::Timer(timer));

    let timer_cb = g.timers.obj_mut(timer);
    timer_cb.active = true;

    if let Some(delay) = timer_cb.delay {
        let at = timeout::current_time::<Traits>(g).wrapping_add(delay);
        timeout::insert_timeout::<Traits>(g, TimeoutTarget::Timer(timer), at);
    }
}

fn stop_timer(g: &mut Globals, timer: TimerId) {
    timeout::remove_timeout(g, TimeoutTarget::Timer(timer));
    g.timers.obj_mut(timer).active = false;
}

fn kill_inner(g: &mut Globals, timer: TimerId) {
    stop_timer(g, timer);
    let wait_queue = g.timers.obj(timer).wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}

/// Handle the expiration of a timer's timeout, which was scheduled at `at`
/// and has just been removed from the timeout heap.
///
/// The callback is called with CPU Lock released. The returned guard is a
/// fresh CPU Lock.
pub(crate) fn handle_expiry<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    timer: TimerId,
    at: Ticks,
) -> CpuLockGuard<Traits> {
    let g = globals(&mut *lock);
    let timer_cb = g.timers.obj_mut(timer);
    debug_assert!(timer_cb.active);

    log::trace!("timer {:?} fired (scheduled at {})", timer, at);

    // Re-arm a periodic timer relative to the scheduled time, not the
    // current time
    match timer_cb.period {
        Some(period) => {
            let next_at = at.wrapping_add(period);
            timeout::insert_timeout::<Traits>(g, TimeoutTarget::Timer(timer), next_at);
        }
        None => timer_cb.active = false,
    }

    let timer_cb = g.timers.obj_mut(timer);
    let wait_queue = timer_cb.wait_queue;
    let callback = timer_cb.callback.take();
    timer_cb.firing = callback.is_some();

    wait::wake_up_all(g, wait_queue, Ok(()));

    let mut callback = match callback {
        Some(callback) => callback,
        None => return lock,
    };

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    callback();

    // Re-acquire CPU Lock. We are in an interrupt context, so nobody else
    // can be holding it.
    let mut lock = lock_cpu::<Traits>().unwrap();

    // Give the callback back unless the timer was deleted in the meantime
    if let Ok(timer_cb) = globals(&mut *lock).timers.cb_mut(timer) {
        if timer_cb.firing {
            timer_cb.firing = false;
            timer_cb.callback = Some(callback);
        }
    }

    lock
}
