//! Per-job publish/subscribe output buffer (spec §4.2).
//!
//! A single append-only byte log backs every job's combined stdout/stderr.
//! Live subscribers receive each write as it happens; a subscriber that
//! attaches late is first caught up with the log as it stood at attach time,
//! under the same lock acquisition that installs it, so no write can be
//! double-delivered or dropped across the attach boundary.

use std::sync::RwLock;

use tracing::debug;

/// A write destination for a subscriber. Implementors report failure once
/// the consumer has gone away (e.g. the gRPC stream's receiver was dropped),
/// at which point the stream removes them.
pub trait Sink: Send + Sync {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

struct Inner {
    log: Vec<u8>,
    subscribers: Vec<Box<dyn Sink>>,
    closed: bool,
}

pub struct OutputStream {
    inner: RwLock<Inner>,
}

impl OutputStream {
    pub fn new() -> Self {
        OutputStream {
            inner: RwLock::new(Inner {
                log: Vec::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Append `chunk` to the log, then broadcast it to every live
    /// subscriber. A subscriber whose write fails is dropped; broadcast
    /// failures never propagate to the caller (the producing child process).
    pub fn write(&self, chunk: &[u8]) -> usize {
        let mut inner = self.inner.write().expect("output stream lock poisoned");
        inner.log.extend_from_slice(chunk);
        inner.subscribers.retain_mut(|sink| match sink.write(chunk) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "subscriber write failed, dropping it");
                false
            }
        });
        chunk.len()
    }

    /// Return a defensive copy of everything written so far.
    pub fn backfill(&self) -> Vec<u8> {
        self.inner.read().expect("output stream lock poisoned").log.clone()
    }

    /// Atomically deliver the backfill log to `sink` and install it as a
    /// live subscriber, all under one write-lock acquisition. This is the
    /// only attach entry point: splitting backfill delivery and subscribe
    /// into separate calls would admit a write landing in neither or both.
    /// A sink that fails on the initial backfill is never subscribed.
    pub fn attach_with_backfill(&self, mut sink: Box<dyn Sink>) {
        let mut inner = self.inner.write().expect("output stream lock poisoned");
        if !inner.log.is_empty() {
            if let Err(e) = sink.write(&inner.log) {
                debug!(error = %e, "backfill delivery failed, dropping subscriber before install");
                return;
            }
        }
        inner.subscribers.push(sink);
    }

    /// Mark the stream closed. Existing subscribers are left installed;
    /// callers observe closure via [`OutputStream::is_closed`].
    pub fn close(&self) {
        self.inner.write().expect("output stream lock poisoned").closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().expect("output stream lock poisoned").closed
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<u8>>>);

    impl Sink for RecordingSink {
        fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
    }

    struct DeadSink;

    impl Sink for DeadSink {
        fn write(&mut self, _chunk: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("peer gone"))
        }
    }

    #[test]
    fn backfill_then_subscribe_sees_prior_and_subsequent_writes() {
        let stream = OutputStream::new();
        stream.write(b"A\n");

        let received = Arc::new(Mutex::new(Vec::new()));
        stream.attach_with_backfill(Box::new(RecordingSink(received.clone())));
        stream.write(b"B\n");

        assert_eq!(*received.lock().unwrap(), b"A\nB\n".to_vec());
    }

    #[test]
    fn multiple_subscribers_observe_the_same_order() {
        let stream = OutputStream::new();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        stream.attach_with_backfill(Box::new(RecordingSink(a.clone())));
        stream.attach_with_backfill(Box::new(RecordingSink(b.clone())));

        for chunk in [&b"one "[..], b"two ", b"three"] {
            stream.write(chunk);
        }

        assert_eq!(*a.lock().unwrap(), b"one two three".to_vec());
        assert_eq!(*b.lock().unwrap(), b"one two three".to_vec());
    }

    #[test]
    fn dead_subscriber_is_dropped_without_affecting_the_log() {
        let stream = OutputStream::new();
        stream.attach_with_backfill(Box::new(DeadSink));
        stream.write(b"still logged");
        assert_eq!(stream.backfill(), b"still logged");
    }

    #[test]
    fn sink_failing_on_initial_backfill_is_never_subscribed() {
        let stream = OutputStream::new();
        stream.write(b"already here");
        // DeadSink always errors, including on the backfill delivery itself;
        // it must not end up in the subscriber list at all.
        stream.attach_with_backfill(Box::new(DeadSink));
        stream.write(b"more");
        assert_eq!(stream.backfill(), b"already heremore");
    }

    #[test]
    fn backfill_is_a_defensive_copy() {
        let stream = OutputStream::new();
        stream.write(b"hello");
        let mut snapshot = stream.backfill();
        snapshot.push(b'!');
        assert_eq!(stream.backfill(), b"hello");
    }

    #[test]
    fn close_does_not_remove_subscribers() {
        let stream = OutputStream::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        stream.attach_with_backfill(Box::new(RecordingSink(received.clone())));
        stream.close();
        assert!(stream.is_closed());
        stream.write(b"post-close");
        assert_eq!(*received.lock().unwrap(), b"post-close".to_vec());
    }
}
