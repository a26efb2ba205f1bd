//! Channel wrapper that reports closure back to the coordinator.
//!
//! Wraps whatever channel the document store handed out after
//! [`crate::coordinator::LockCoordinator::check_permission`] and pairs it
//! with the tracked-stream handle from `report_channel_opened`. Closing is
//! an explicit, fallible call; dropping without closing still notifies the
//! coordinator, with a warning if that fails.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::warn;

use crate::coordinator::LockCoordinator;
use crate::streams::StreamHandle;
use crate::types::LockError;

/// A channel that notifies the coordinator when it closes.
pub struct Vigilant<T> {
    inner: T,
    handle: Option<StreamHandle>,
    coordinator: Arc<LockCoordinator>,
}

impl<T> Vigilant<T> {
    /// Pairs an open channel with its tracked-stream handle.
    pub fn new(inner: T, coordinator: Arc<LockCoordinator>, handle: StreamHandle) -> Self {
        Self {
            inner,
            handle: Some(handle),
            coordinator,
        }
    }

    /// The tracked-stream handle this channel reports under.
    pub fn handle(&self) -> Option<StreamHandle> {
        self.handle
    }

    /// Returns a reference to the wrapped channel.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Returns a mutable reference to the wrapped channel.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Closes the channel, reporting it to the coordinator.
    ///
    /// Use this instead of dropping when the caller needs to observe
    /// failures (for example a rejected deferred release of a
    /// self-closing grant's last stream).
    pub fn close(mut self) -> Result<(), LockError> {
        match self.handle.take() {
            Some(handle) => self.coordinator.report_channel_closed(handle),
            None => Ok(()),
        }
    }
}

impl<T: Read> Read for Vigilant<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Write> Write for Vigilant<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<T> Drop for Vigilant<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.coordinator.report_channel_closed(handle) {
                warn!(stream = handle.as_u64(), error = %e, "failed to report channel close");
            }
        }
    }
}
