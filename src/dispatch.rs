//! Delivery of state updates to a caller-supplied handler.

use crate::registry::DeviceState;

/// Error a handler may return. The daemon logs it and keeps scanning.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every successfully decoded advertisement after the registry has
/// been updated.
///
/// Handlers run inline on the scanning task, so a slow handler delays the
/// next poll.
pub trait Handler {
    fn handle(&mut self, state: &DeviceState, is_new: bool) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: FnMut(&DeviceState, bool) -> Result<(), HandlerError>,
{
    fn handle(&mut self, state: &DeviceState, is_new: bool) -> Result<(), HandlerError> {
        self(state, is_new)
    }
}

/// A handler that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn handle(&mut self, _state: &DeviceState, _is_new: bool) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Invoke the handler once for one update.
pub fn deliver<H: Handler + ?Sized>(
    handler: &mut H,
    state: &DeviceState,
    is_new: bool,
) -> Result<(), HandlerError> {
    handler.handle(state, is_new)
}
