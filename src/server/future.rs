//! Memoized, multicast result of a server creation
//!
//! Every caller interested in a hostname's port attaches a waiter. The first
//! resolution fans out to all waiters in the order they attached; waiters
//! attached later are answered immediately.

use parking_lot::Mutex;

type Waiter = Box<dyn FnOnce(Result<u16, String>) + Send>;

enum State {
    Pending(Vec<Waiter>),
    Ready(u16),
    Failed(String),
}

pub struct PortFuture {
    state: Mutex<State>,
}

impl PortFuture {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
        }
    }

    /// Run `waiter` once the port is known
    pub fn on_ready<F>(&self, waiter: F)
    where
        F: FnOnce(Result<u16, String>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    waiters.push(Box::new(waiter));
                    return;
                }
                State::Ready(port) => Ok(*port),
                State::Failed(reason) => Err(reason.clone()),
            }
        };
        waiter(outcome);
    }

    /// Settle the future and notify every waiter; later calls are ignored
    pub fn resolve(&self, outcome: Result<u16, String>) {
        let waiters = {
            let mut state = self.state.lock();
            if !matches!(*state, State::Pending(_)) {
                return;
            }
            let next = match &outcome {
                Ok(port) => State::Ready(*port),
                Err(reason) => State::Failed(reason.clone()),
            };
            match std::mem::replace(&mut *state, next) {
                State::Pending(waiters) => waiters,
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            waiter(outcome.clone());
        }
    }

    pub fn port(&self) -> Option<u16> {
        match *self.state.lock() {
            State::Ready(port) => Some(port),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), State::Pending(_))
    }
}

impl Default for PortFuture {
    fn default() -> Self {
        Self::new()
    }
}
