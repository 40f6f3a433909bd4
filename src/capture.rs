//! Redirection of a tool's diagnostic output into the worker log.
//!
//! Tools report progress through three channels (message, warning, error) on a [`DiagnosticChannels`] slot.
//! [`OutputCapture::begin`] swaps a log-forwarding sink into that slot for its lifetime, and dropping the guard puts
//! the previous sink back on every exit path, including unwinding.

use std::io::Write;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Message,
    Warning,
    Error,
}

/// Receiver of tool diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, channel: Channel, text: &str);
}

/// Messages and warnings to stdout, errors to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdStreams;

impl DiagnosticSink for StdStreams {
    fn emit(&self, channel: Channel, text: &str) {
        // Console write failures are not actionable here.
        let _ = match channel {
            Channel::Message | Channel::Warning => writeln!(std::io::stdout(), "{text}"),
            Channel::Error => writeln!(std::io::stderr(), "{text}"),
        };
    }
}

/// Shared slot holding the sink tool output is currently written to.
#[derive(Clone)]
pub struct DiagnosticChannels {
    current: Arc<RwLock<Arc<dyn DiagnosticSink>>>,
}

impl DiagnosticChannels {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            current: Arc::new(RwLock::new(sink)),
        }
    }

    pub fn emit(&self, channel: Channel, text: &str) {
        self.current().emit(channel, text);
    }

    fn current(&self) -> Arc<dyn DiagnosticSink> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, sink: Arc<dyn DiagnosticSink>) -> Arc<dyn DiagnosticSink> {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, sink)
    }
}

impl Default for DiagnosticChannels {
    fn default() -> Self {
        Self::new(Arc::new(StdStreams))
    }
}

impl std::fmt::Debug for DiagnosticChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticChannels").finish_non_exhaustive()
    }
}

/// Forwards to `tracing`; errors are also passed on to the sink that was active before the capture.
struct LogForwarder {
    previous: Arc<dyn DiagnosticSink>,
}

impl DiagnosticSink for LogForwarder {
    fn emit(&self, channel: Channel, text: &str) {
        let text = text.trim_end_matches(['\r', '\n']);
        match channel {
            Channel::Message => tracing::debug!("{text}"),
            Channel::Warning => tracing::warn!("{text}"),
            Channel::Error => {
                tracing::error!("{text}");
                self.previous.emit(Channel::Error, text);
            }
        }
    }
}

/// Active capture. Restores the previous sink when dropped.
pub struct OutputCapture<'a> {
    channels: &'a DiagnosticChannels,
    previous: Option<Arc<dyn DiagnosticSink>>,
}

impl<'a> OutputCapture<'a> {
    pub fn begin(channels: &'a DiagnosticChannels) -> Self {
        let previous = channels.current();
        channels.replace(Arc::new(LogForwarder {
            previous: previous.clone(),
        }));
        Self {
            channels,
            previous: Some(previous),
        }
    }
}

impl Drop for OutputCapture<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.channels.replace(previous);
        }
    }
}
