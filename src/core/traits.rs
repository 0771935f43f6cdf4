//! Seams towards the RPC payload protocol.
//!
//! The transport never interprets frame contents. It hands decoded opaque
//! frame bytes to every registered [`FrameConsumer`] of a connection.

/// Receiver of inbound frames for one duplex connection.
///
/// Consumers are invoked on the poller thread, sequentially. A consumer must
/// not block: every other connection waits behind it.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl FrameConsumer for Printer {
///     fn on_frame(&self, frame: &[u8]) {
///         println!("{} bytes", frame.len());
///     }
/// }
/// ```
pub trait FrameConsumer: Send + Sync + 'static {
    /// One inbound FRAME payload. The slice is only valid for this call.
    fn on_frame(&self, frame: &[u8]);

    /// The connection closed. No further frames follow.
    ///
    /// Called at most once, and never after the consumer was unregistered.
    fn on_close(&self) {}
}

impl<F> FrameConsumer for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn on_frame(&self, frame: &[u8]) {
        self(frame)
    }
}
