//! Async request state machine for fabric operations.

use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;

use super::fabric::DataPlaneError;

/// Observable request state. Transitions are monotone:
/// `Init → Running → {Completed, Cancelled, Failed}`; terminal states are
/// never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Init,
    Running,
    Completed,
    Cancelled,
    Failed,
}

enum Inner {
    Init,
    Running,
    Completed { payload: Option<Bytes> },
    Cancelled,
    Failed(DataPlaneError),
}

impl Inner {
    fn snapshot(&self) -> RequestState {
        match self {
            Inner::Init => RequestState::Init,
            Inner::Running => RequestState::Running,
            Inner::Completed { .. } => RequestState::Completed,
            Inner::Cancelled => RequestState::Cancelled,
            Inner::Failed(_) => RequestState::Failed,
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, Inner::Init | Inner::Running)
    }
}

type CancelHook = Box<dyn FnOnce() -> bool + Send>;

/// An in-flight fabric operation.
///
/// The data plane moves a clone of the `Arc<Request>` into the fabric
/// completion closure, so the request outlives a caller that drops its
/// handle before completion; the completion firing is the sole release
/// path for that reference. Completions run on the progress thread and
/// only flip state and wake waiters.
pub struct Request {
    state: Mutex<Inner>,
    cv: Condvar,
    cancel: Mutex<Option<CancelHook>>,
}

impl Request {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Inner::Init),
            cv: Condvar::new(),
            cancel: Mutex::new(None),
        })
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().expect("request state poisoned");
        if matches!(*state, Inner::Init) {
            *state = Inner::Running;
        }
    }

    pub(crate) fn set_cancel_hook(&self, hook: CancelHook) {
        *self.cancel.lock().expect("request cancel poisoned") = Some(hook);
    }

    /// Terminal transition. Later calls on an already-terminal request are
    /// ignored, which keeps cancellation racing a completion benign.
    pub(crate) fn complete(&self, result: Result<Option<Bytes>, DataPlaneError>) {
        let mut state = self.state.lock().expect("request state poisoned");
        if state.is_terminal() {
            return;
        }
        *state = match result {
            Ok(payload) => Inner::Completed { payload },
            Err(DataPlaneError::Cancelled) => Inner::Cancelled,
            Err(err) => Inner::Failed(err),
        };
        drop(state);
        self.cv.notify_all();
    }

    /// Block the calling task until the operation reaches a terminal
    /// state. Returns the delivered payload for data operations.
    pub fn wait(&self) -> Result<Option<Bytes>, DataPlaneError> {
        let mut state = self.state.lock().expect("request state poisoned");
        while !state.is_terminal() {
            state = self.cv.wait(state).expect("request state poisoned");
        }
        match &mut *state {
            Inner::Completed { payload } => Ok(payload.take()),
            Inner::Cancelled => Err(DataPlaneError::Cancelled),
            Inner::Failed(err) => Err(err.clone()),
            Inner::Init | Inner::Running => unreachable!("terminal state checked above"),
        }
    }

    /// Abort the operation if it is still pending. Completed requests
    /// ignore cancellation.
    pub fn cancel(&self) {
        {
            let state = self.state.lock().expect("request state poisoned");
            if state.is_terminal() {
                return;
            }
        }
        let hook = self.cancel.lock().expect("request cancel poisoned").take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn state(&self) -> RequestState {
        self.state.lock().expect("request state poisoned").snapshot()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().expect("request state poisoned").is_terminal()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_terminal_and_sticky() {
        let request = Request::new();
        assert_eq!(request.state(), RequestState::Init);
        request.mark_running();
        assert_eq!(request.state(), RequestState::Running);

        request.complete(Ok(Some(Bytes::from_static(b"payload"))));
        assert_eq!(request.state(), RequestState::Completed);

        // A late failure must not overwrite the terminal state.
        request.complete(Err(DataPlaneError::Fabric {
            op: "send",
            reason: "late".into(),
        }));
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(request.wait().unwrap().unwrap(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn cancelled_error_maps_to_cancelled_state() {
        let request = Request::new();
        request.mark_running();
        request.complete(Err(DataPlaneError::Cancelled));
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_eq!(request.wait(), Err(DataPlaneError::Cancelled));
    }

    #[test]
    fn cancel_after_completion_is_ignored() {
        let request = Request::new();
        request.mark_running();
        request.set_cancel_hook(Box::new(|| panic!("must not run after completion")));
        request.complete(Ok(None));
        request.cancel();
        assert_eq!(request.state(), RequestState::Completed);
    }

    #[test]
    fn wait_blocks_until_progress_thread_completes() {
        let request = Request::new();
        request.mark_running();
        let waiter = Arc::clone(&request);
        let join = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        request.complete(Ok(None));
        assert!(join.join().unwrap().is_ok());
    }
}
