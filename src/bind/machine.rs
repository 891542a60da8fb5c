//! Read/write state machine for target-backed bindings
//!
//! Pure and synchronous: the async driver (`AsyncBindValue`) feeds it events,
//! including completions of the reads and writes it started, and performs the
//! returned `Action`. At most one read or write is outstanding at any time.
//!
//! ```text
//!   Idle ──refresh/kick──▶ Read ──done──▶ Idle (commit)
//!   Idle/Error ──value──▶ Write ──done──▶ Read (verify) | Idle
//!   Write/Read ──value──▶ DelayedWrite ──done──▶ Write (last value)
//!   Read ──index──▶ DelayedRead ──done──▶ Read
//!   any ──critical error──▶ Error ──cleared──▶ Idle (+ read kick)
//! ```

use std::fmt;

use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Read,
    Write,
    DelayedWrite,
    DelayedRead,
    Error,
}

/// Capability qualifiers that restrict a target-backed binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    ReadOnly,
    WriteOnly,
    NonVolatile,
    Const,
    Interrupt,
    NoVerify,
}

impl Qualifier {
    pub const ALL: [Qualifier; 6] = [
        Qualifier::ReadOnly,
        Qualifier::WriteOnly,
        Qualifier::NonVolatile,
        Qualifier::Const,
        Qualifier::Interrupt,
        Qualifier::NoVerify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Qualifier::ReadOnly => "readonly",
            Qualifier::WriteOnly => "writeonly",
            Qualifier::NonVolatile => "nonvolatile",
            Qualifier::Const => "const",
            Qualifier::Interrupt => "interrupt",
            Qualifier::NoVerify => "noverify",
        }
    }

    pub fn parse(name: &str) -> Option<Qualifier> {
        Self::ALL
            .into_iter()
            .find(|q| q.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub volatile: bool,
    pub verifiable: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            volatile: true,
            verifiable: true,
        }
    }
}

impl Capabilities {
    /// Apply a qualifier. Returns false when the result is neither readable nor writable.
    pub fn apply(&mut self, qualifier: Qualifier) -> bool {
        match qualifier {
            Qualifier::ReadOnly => self.writable = false,
            Qualifier::WriteOnly => self.readable = false,
            Qualifier::Const | Qualifier::Interrupt => self.writable = false,
            Qualifier::NonVolatile | Qualifier::NoVerify => {}
        }
        if matches!(
            qualifier,
            Qualifier::NonVolatile | Qualifier::Const | Qualifier::WriteOnly | Qualifier::Interrupt
        ) {
            self.volatile = false;
        }
        if qualifier == Qualifier::NoVerify || !self.readable || !self.writable {
            self.verifiable = false;
        }
        self.readable || self.writable
    }
}

/// Facts about the binding the machine needs but does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub connected: bool,
    pub deferred: bool,
    pub deferred_write_pending: bool,
    pub has_listeners: bool,
    /// False when the model ignores writes while disconnected and is disconnected.
    pub write_allowed: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            connected: true,
            deferred: false,
            deferred_write_pending: false,
            has_listeners: false,
            write_allowed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// Explicit refresh request
    Refresh { force: bool },
    /// Initial read for bindings that are not polled
    KickStart { force: bool },
    /// Local value change to push to the target
    ValueChanged,
    IndexChanged,
    ReadCompleted,
    WriteCompleted,
    /// The outstanding read or write failed
    OperationFailed,
    CriticalError,
    CriticalErrorCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Start a read of the target
    Read,
    /// Start a write of the committed value
    Write,
    /// A write is in flight; the committed value is buffered for a follow-up write
    Buffer,
    /// Commit the completed read's value into the cache
    Commit,
    /// Local value change was not written (read-only, deferred or disallowed)
    Ignored,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    caps: Capabilities,
    busy: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(Capabilities::default())
    }
}

impl StateMachine {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            state: State::Idle,
            caps,
            busy: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// True while a read or write is outstanding.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Idle, volatile and not holding back a deferred write.
    pub fn is_refreshable(&self, ctx: &Context) -> bool {
        self.state == State::Idle && self.caps.volatile && !ctx.deferred_write_pending
    }

    /// Apply a capability qualifier. Returns `(valid, needs_read_kick)`; the kick is
    /// requested when a volatile binding becomes non-volatile.
    pub fn set_qualifier(&mut self, qualifier: Qualifier, name: &str) -> (bool, bool) {
        let was_volatile = self.caps.volatile;
        let valid = self.caps.apply(qualifier);
        if !valid {
            error!(
                "Invalid qualifier .${} added to binding \"{}\" that already has an existing .${} or .${} qualifier.",
                Qualifier::WriteOnly,
                name,
                Qualifier::ReadOnly,
                Qualifier::Const
            );
        }
        (valid, was_volatile && !self.caps.volatile)
    }

    /// Single transition entry point.
    pub fn transition(&mut self, event: MachineEvent, ctx: &Context) -> Action {
        let before = self.state;
        let action = match event {
            MachineEvent::Refresh { force } => self.on_refresh(force, ctx),
            MachineEvent::KickStart { force } => self.on_kick_start(force, ctx),
            MachineEvent::ValueChanged => self.on_value_changed(ctx),
            MachineEvent::IndexChanged => self.on_index_changed(ctx),
            MachineEvent::ReadCompleted => self.on_done(true, ctx),
            MachineEvent::WriteCompleted => self.on_done(false, ctx),
            MachineEvent::OperationFailed => {
                self.busy = false;
                match self.state {
                    State::Error => Action::None,
                    State::DelayedWrite => {
                        self.state = State::Write;
                        Action::Write
                    }
                    _ => {
                        self.state = State::Idle;
                        Action::None
                    }
                }
            }
            MachineEvent::CriticalError => {
                self.state = State::Error;
                Action::None
            }
            MachineEvent::CriticalErrorCleared => self.on_error_cleared(),
        };
        if matches!(action, Action::Read | Action::Write) {
            self.busy = true;
        }
        if before != self.state {
            debug!(?event, from = ?before, to = ?self.state, ?action, "bind state transition");
        }
        action
    }

    fn start_read(&mut self) -> Action {
        self.state = State::Read;
        Action::Read
    }

    fn on_refresh(&mut self, force: bool, ctx: &Context) -> Action {
        if !self.busy && self.is_refreshable(ctx) && (ctx.has_listeners || force) {
            self.start_read()
        } else {
            Action::None
        }
    }

    fn on_kick_start(&mut self, force: bool, ctx: &Context) -> Action {
        if self.busy || self.state != State::Idle {
            return Action::None;
        }
        if force || (!self.caps.volatile && self.caps.readable && !ctx.deferred_write_pending) {
            self.start_read()
        } else {
            Action::None
        }
    }

    fn on_value_changed(&mut self, ctx: &Context) -> Action {
        if !self.caps.writable || ctx.deferred || !ctx.write_allowed {
            return Action::Ignored;
        }
        if matches!(self.state, State::Idle | State::Error) && !self.busy {
            self.state = State::Write;
            Action::Write
        } else {
            self.state = State::DelayedWrite;
            Action::Buffer
        }
    }

    fn on_index_changed(&mut self, ctx: &Context) -> Action {
        if !ctx.has_listeners || !self.caps.volatile {
            return Action::None;
        }
        if self.state == State::Read {
            self.state = State::DelayedRead;
            Action::None
        } else {
            self.on_refresh(true, ctx)
        }
    }

    fn on_done(&mut self, read: bool, ctx: &Context) -> Action {
        self.busy = false;
        match self.state {
            State::DelayedWrite => {
                self.state = State::Write;
                Action::Write
            }
            State::Write | State::DelayedRead => self.read_back_or_idle(ctx),
            State::Read if !ctx.connected => self.read_back_or_idle(ctx),
            State::Read => {
                self.state = State::Idle;
                if read && !ctx.deferred_write_pending {
                    Action::Commit
                } else {
                    Action::None
                }
            }
            State::Idle | State::Error => Action::None,
        }
    }

    fn read_back_or_idle(&mut self, ctx: &Context) -> Action {
        if self.caps.readable
            && !ctx.deferred_write_pending
            && (self.state != State::Write || self.caps.verifiable)
        {
            self.start_read()
        } else {
            self.state = State::Idle;
            Action::None
        }
    }

    fn on_error_cleared(&mut self) -> Action {
        if self.state != State::Error {
            return Action::None;
        }
        if self.busy {
            // restart reading once the stale operation completes
            self.state = if self.caps.readable {
                State::DelayedRead
            } else {
                State::Write
            };
            return Action::None;
        }
        self.state = State::Idle;
        if self.caps.readable {
            self.start_read()
        } else {
            Action::None
        }
    }
}
