use std::cell::Cell;
use std::rc::Rc;

/// External cancellation signal.
///
/// A cloneable one-shot flag. Pass a clone to [`RequestOptions::signal`] and
/// keep the original; calling [`abort()`][Signal::abort] makes the engine
/// cancel the request on its next [`tick()`][crate::ClientRequest::tick].
///
/// Once aborted, the signal stays aborted.
///
/// [`RequestOptions::signal`]: crate::RequestOptions::signal
#[derive(Debug, Clone, Default)]
pub struct Signal(Rc<Cell<bool>>);

impl Signal {
    pub fn new() -> Self {
        Signal::default()
    }

    pub fn abort(&self) {
        self.0.set(true);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.get()
    }
}
