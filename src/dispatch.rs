//! Process-thread to script-thread callback dispatch.
//!
//! Handlers are registered on the script thread and invoked there; the
//! process thread only posts small call records. Call records are boxed once,
//! up front, into a fixed pool owned by the posting side: the process thread
//! acquires a spent box, fills it and posts it; the script thread executes the
//! handler and sends the box back. The process thread therefore never touches
//! the allocator, and the return path is the mirror-image collector of the
//! event path (its direction is fixed and never reversed).

use std::fmt;

use crate::queue::{spsc, QueueReader, QueueWriter};

/// Most arguments any script callback takes (bar, units, division, value).
pub const MAX_CALL_ARGS: usize = 4;

/// Identifies a registered script handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u32);

/// One queued callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct ScriptCall {
    handler: HandlerId,
    args: [f64; MAX_CALL_ARGS],
    argc: u8,
}

impl ScriptCall {
    fn empty() -> Self {
        Self {
            handler: HandlerId(0),
            args: [0.0; MAX_CALL_ARGS],
            argc: 0,
        }
    }
}

/// Create the dispatch pair with `capacity` in-flight calls.
pub fn dispatch(capacity: usize) -> (CallSender, CallReceiver) {
    let (call_tx, call_rx) = spsc(capacity);
    let (return_tx, return_rx) = spsc(capacity);
    let pool = (0..capacity)
        .map(|_| Box::new(ScriptCall::empty()))
        .collect();
    (
        CallSender {
            queue: call_tx,
            returns: return_rx,
            pool,
            waiting: Vec::with_capacity(capacity),
            missed: 0,
        },
        CallReceiver {
            queue: call_rx,
            returns: return_tx,
            handlers: Vec::new(),
        },
    )
}

/// Process-thread half: posts callback invocations without ever waiting.
pub struct CallSender {
    queue: QueueWriter<Box<ScriptCall>>,
    returns: QueueReader<Box<ScriptCall>>,
    pool: Vec<Box<ScriptCall>>,
    // calls that found the queue full; flushed on later cycles, never blocks
    waiting: Vec<Box<ScriptCall>>,
    missed: u64,
}

impl CallSender {
    /// Queue a handler invocation. Returns false if the fixed call pool is
    /// exhausted (every box in flight); the call is then dropped and counted.
    pub fn post(&mut self, handler: HandlerId, args: &[f64]) -> bool {
        debug_assert!(args.len() <= MAX_CALL_ARGS);
        self.reclaim();
        let Some(mut call) = self.pool.pop() else {
            self.missed += 1;
            return false;
        };
        call.handler = handler;
        call.argc = args.len().min(MAX_CALL_ARGS) as u8;
        call.args[..call.argc as usize].copy_from_slice(&args[..call.argc as usize]);
        if let Err(rejected) = self.queue.try_send(call) {
            self.waiting.push(rejected);
        }
        true
    }

    /// Per-cycle housekeeping: recover spent boxes, retry waiting calls.
    pub fn flush(&mut self) {
        self.reclaim();
        while let Some(call) = self.waiting.pop() {
            if let Err(rejected) = self.queue.try_send(call) {
                self.waiting.push(rejected);
                return;
            }
        }
    }

    /// Calls dropped because the pool was exhausted.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn reclaim(&mut self) {
        while let Some(spent) = self.returns.try_recv() {
            self.pool.push(spent);
        }
    }
}

/// A registered script callback.
pub type Handler = Box<dyn FnMut(&[f64])>;

/// Script-thread half: handler registry plus the drain loop.
pub struct CallReceiver {
    queue: QueueReader<Box<ScriptCall>>,
    returns: QueueWriter<Box<ScriptCall>>,
    handlers: Vec<(u8, Handler)>,
}

impl CallReceiver {
    /// Register a handler taking exactly `required_args` arguments.
    ///
    /// The arity is validated now, at registration, so a bad callback fails
    /// on the script thread instead of misfiring later.
    pub fn register(
        &mut self,
        required_args: u8,
        handler: Handler,
    ) -> Result<HandlerId, DispatchError> {
        if required_args as usize > MAX_CALL_ARGS {
            return Err(DispatchError::ArityMismatch {
                required: required_args,
                max: MAX_CALL_ARGS as u8,
            });
        }
        let id = HandlerId(self.handlers.len() as u32);
        self.handlers.push((required_args, handler));
        Ok(id)
    }

    /// Invoke every queued call and return the boxes to the sender's pool.
    /// Returns how many calls ran.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Some(call) = self.queue.try_recv() {
            if let Some((required, handler)) = self.handlers.get_mut(call.handler.0 as usize) {
                let argc = (*required).min(call.argc) as usize;
                handler(&call.args[..argc]);
                ran += 1;
            }
            self.returns.send(call);
        }
        ran
    }
}

/// Errors from handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The callback wants more arguments than any dispatch site provides.
    ArityMismatch { required: u8, max: u8 },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ArityMismatch { required, max } => {
                write!(f, "handler requires {required} arguments, at most {max} available")
            }
        }
    }
}

impl std::error::Error for DispatchError {}
