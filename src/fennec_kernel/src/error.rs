//! Result codes and error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use fennec_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel can report.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object identifier is invalid. This usually means the
        /// object was deleted.
        BadId = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        WouldDeadlock = -30,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// An operation or an object couldn't be enqueued because there are too
        /// many of such things that already have been enqueued.
        QueueOverflow = -43,
        /// The wait operation was aborted because the waited object was killed.
        Stopped = -49,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

// Errors shared by many operations
// ---------------------------------------------------------------------------

define_error! {
    mod wait_error {}
    /// Error type for the outcome of a blocking wait.
    pub enum WaitError {
        /// The timeout expired before the wait condition was satisfied.
        Timeout,
        /// The object was killed while the task was waiting on it.
        Stopped,
    }
}

define_error! {
    mod create_error {}
    /// Error type for the functions that create kernel objects.
    pub enum CreateError {
        /// The current context disallows the operation (e.g., CPU Lock is
        /// active).
        BadContext,
        /// A parameter is out of range.
        BadParam,
    }
}

define_error! {
    mod query_error {}
    /// Error type for non-blocking operations that only read an object's
    /// state.
    pub enum QueryError {
        /// The object was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod update_error {}
    /// Error type for non-blocking operations that always succeed on a live
    /// object.
    pub enum UpdateError {
        /// The object was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod kill_error {}
    /// Error type for `kill` on synchronization and communication objects.
    pub enum KillError {
        /// The object was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod delete_error {}
    /// Error type for `delete` on synchronization and communication objects.
    pub enum DeleteError {
        /// The object was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wait_object_error {}
    /// Error type for the blocking operations that don't have their own error
    /// type.
    pub enum WaitObjectError: WaitError {
        /// The object was deleted.
        BadId,
        /// CPU Lock is active, or the operation needed to block in a
        /// non-task context.
        BadContext,
        /// The timeout is out of range, or a buffer has a wrong size.
        BadParam,
        Timeout,
        Stopped,
    }
}

// Task errors
// ---------------------------------------------------------------------------

define_error! {
    mod start_task_error {}
    /// Error type for [`Task::start`].
    ///
    /// [`Task::start`]: crate::Task::start
    pub enum StartTaskError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The task is already active.
        QueueOverflow,
    }
}

define_error! {
    mod kill_task_error {}
    /// Error type for [`Task::kill`].
    ///
    /// [`Task::kill`]: crate::Task::kill
    pub enum KillTaskError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The task is not active.
        BadObjectState,
    }
}

define_error! {
    mod join_task_error {}
    /// Error type for [`Task::join`].
    ///
    /// [`Task::join`]: crate::Task::join
    pub enum JoinTaskError: WaitError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The timeout is out of range.
        BadParam,
        /// The task tried to join itself.
        WouldDeadlock,
        /// The task is detached, or another task is already joining it.
        BadObjectState,
        Timeout,
        Stopped,
    }
}

define_error! {
    mod detach_task_error {}
    /// Error type for [`Task::detach`].
    ///
    /// [`Task::detach`]: crate::Task::detach
    pub enum DetachTaskError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The task is already detached, or another task is joining it.
        BadObjectState,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`Task::suspend`] and [`Task::resume`].
    ///
    /// [`Task::suspend`]: crate::Task::suspend
    /// [`Task::resume`]: crate::Task::resume
    pub enum SuspendTaskError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The task is not active, or is already in the requested state.
        BadObjectState,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`Task::set_priority`].
    ///
    /// [`Task::set_priority`]: crate::Task::set_priority
    pub enum SetTaskPriorityError {
        /// The task was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range.
        BadParam,
    }
}

define_error! {
    mod get_current_task_error {}
    /// Error type for [`Task::current`].
    ///
    /// [`Task::current`]: crate::Task::current
    pub enum GetCurrentTaskError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`System::exit_task`].
    ///
    /// [`System::exit_task`]: crate::System::exit_task
    pub enum ExitTaskError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`System::sleep`].
    ///
    /// [`System::sleep`]: crate::System::sleep
    pub enum SleepError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The timeout is out of range or [`Forever`].
        ///
        /// [`Forever`]: crate::Timeout::Forever
        BadParam,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`].
    ///
    /// [`System::yield_now`]: crate::System::yield_now
    pub enum YieldError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod time_error {}
    /// Error type for [`System::time`].
    ///
    /// [`System::time`]: crate::System::time
    pub enum TimeError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Mutex and condition variable errors
// ---------------------------------------------------------------------------

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`].
    ///
    /// [`Mutex::lock`]: crate::Mutex::lock
    pub enum LockMutexError: WaitError {
        /// The mutex was deleted.
        BadId,
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The timeout is out of range.
        BadParam,
        /// The current task already owns the mutex, and the mutex is an
        /// error-checking one.
        WouldDeadlock,
        Timeout,
        Stopped,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`].
    ///
    /// [`Mutex::unlock`]: crate::Mutex::unlock
    pub enum UnlockMutexError {
        /// The mutex was deleted.
        BadId,
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The current task does not own the mutex, or the mutex is unlocked.
        NotOwner,
    }
}

define_error! {
    mod wait_condvar_error {}
    /// Error type for [`Condvar::wait`].
    ///
    /// [`Condvar::wait`]: crate::Condvar::wait
    pub enum WaitCondvarError: WaitError {
        /// The condition variable or the mutex was deleted.
        BadId,
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The timeout is out of range.
        BadParam,
        /// The current task does not own the mutex.
        NotOwner,
        Timeout,
        Stopped,
    }
}

define_error! {
    mod free_block_error {}
    /// Error type for [`MemoryPool::free`].
    ///
    /// [`MemoryPool::free`]: crate::MemoryPool::free
    pub enum FreeBlockError {
        /// The pool was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The pointer does not point to a block allocated from the pool.
        BadParam,
    }
}

// Timer errors
// ---------------------------------------------------------------------------

define_error! {
    mod set_timer_param_error {}
    /// Error type for [`Timer::set_delay`] and [`Timer::set_period`].
    ///
    /// [`Timer::set_delay`]: crate::Timer::set_delay
    /// [`Timer::set_period`]: crate::Timer::set_period
    pub enum SetTimerParamError {
        /// The timer was deleted.
        BadId,
        /// CPU Lock is active.
        BadContext,
        /// The duration is out of range.
        BadParam,
    }
}

// Internal errors
// ---------------------------------------------------------------------------

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(CreateError)]
    #[into(QueryError)]
    #[into(UpdateError)]
    #[into(KillError)]
    #[into(DeleteError)]
    #[into(WaitObjectError)]
    #[into(StartTaskError)]
    #[into(KillTaskError)]
    #[into(JoinTaskError)]
    #[into(DetachTaskError)]
    #[into(SuspendTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetCurrentTaskError)]
    #[into(ExitTaskError)]
    #[into(SleepError)]
    #[into(YieldError)]
    #[into(TimeError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(WaitCondvarError)]
    #[into(FreeBlockError)]
    #[into(SetTimerParamError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(QueryError)]
    #[into(UpdateError)]
    #[into(KillError)]
    #[into(DeleteError)]
    #[into(WaitObjectError)]
    #[into(StartTaskError)]
    #[into(KillTaskError)]
    #[into(JoinTaskError)]
    #[into(DetachTaskError)]
    #[into(SuspendTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(WaitCondvarError)]
    #[into(FreeBlockError)]
    #[into(SetTimerParamError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(CreateError)]
    #[into(WaitObjectError)]
    #[into(JoinTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(SleepError)]
    #[into(LockMutexError)]
    #[into(WaitCondvarError)]
    #[into(FreeBlockError)]
    #[into(SetTimerParamError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

/// Convert a wait outcome to `Ok(())` if it timed out, which is the expected
/// outcome of a sleep.
#[inline]
pub(crate) fn expect_timeout(e: Result<(), WaitError>) {
    match e {
        Err(WaitError::Timeout) => {}
        Ok(()) | Err(WaitError::Stopped) => {
            unreachable!("a sleeping task was woken up by something else")
        }
    }
}
