//! In-process substrate.
//!
//! [`MemoryDriver`] connects publications and subscriptions that share a
//! `(channel, stream)` key inside one process. Delivery is in order and
//! lossless. Offers are split into MTU-sized fragments so the fragment
//! assembler sees the same BEGIN/END sequences a network substrate produces.
//!
//! Fault injection hooks make transient and hard send failures, and images
//! going away, reproducible in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    FragmentFlags, FragmentHeader, ImageInfo, ImageListener, MediaDriver, Publication,
    Subscription, validate_channel,
};
use crate::core::{OfferError, SessionId, SubstrateError};

/// Default fragment payload size.
pub const DEFAULT_MTU: usize = 1408;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    channel: String,
    stream_id: i32,
}

#[derive(Debug, Clone, Copy)]
struct OfferFault {
    error: OfferError,
    remaining: usize,
}

#[derive(Default)]
struct StreamState {
    publications: Vec<SessionId>,
    subscriptions: Vec<Arc<SubscriptionShared>>,
    fault: Option<OfferFault>,
}

struct DriverShared {
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    next_session: AtomicI32,
    mtu: usize,
}

impl DriverShared {
    fn image_info(session_id: SessionId, stream_id: i32) -> ImageInfo {
        ImageInfo {
            session_id,
            stream_id,
            source_identity: format!("memory:{session_id}"),
        }
    }
}

/// In-process media driver.
///
/// Cloning yields another handle to the same driver.
#[derive(Clone)]
pub struct MemoryDriver {
    shared: Arc<DriverShared>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("mtu", &self.shared.mtu)
            .finish_non_exhaustive()
    }
}

impl MemoryDriver {
    /// Create a driver with the default MTU.
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    /// Create a driver that fragments messages larger than `mtu` bytes.
    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                streams: Mutex::new(HashMap::new()),
                next_session: AtomicI32::new(rand::random::<i32>()),
                mtu: mtu.max(1),
            }),
        }
    }

    /// Fragment payload size.
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Fail the next `count` offers to `channel`/`stream_id` with `error`.
    ///
    /// Applies to every publication on the stream, including ones opened
    /// after this call.
    pub fn inject_offer_failures(
        &self,
        channel: &str,
        stream_id: i32,
        error: OfferError,
        count: usize,
    ) {
        let key = StreamKey {
            channel: channel.to_string(),
            stream_id,
        };
        let mut streams = self.shared.streams.lock();
        let stream = streams.entry(key).or_default();
        stream.fault = (count > 0).then_some(OfferFault {
            error,
            remaining: count,
        });
    }

    /// Make every image of `session` unavailable at its subscribers.
    ///
    /// Fragments already queued are still delivered; unavailability is
    /// reported after them. Returns `false` if no image carried the session.
    pub fn close_image(&self, session: SessionId) -> bool {
        let streams = self.shared.streams.lock();
        let mut found = false;
        for stream in streams.values() {
            for subscription in &stream.subscriptions {
                found |= subscription.close_session(session);
            }
        }
        debug!(session = %session, found, "memory driver: closing image");
        found
    }

    /// Number of live images across subscriptions on `channel`/`stream_id`.
    pub fn image_count(&self, channel: &str, stream_id: i32) -> usize {
        let key = StreamKey {
            channel: channel.to_string(),
            stream_id,
        };
        let streams = self.shared.streams.lock();
        streams
            .get(&key)
            .map(|stream| {
                stream
                    .subscriptions
                    .iter()
                    .map(|subscription| subscription.live_images())
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl MediaDriver for MemoryDriver {
    fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Arc<dyn Publication>, SubstrateError> {
        validate_channel(channel)?;
        let session_id = SessionId::new(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        let key = StreamKey {
            channel: channel.to_string(),
            stream_id,
        };

        {
            let mut streams = self.shared.streams.lock();
            let stream = streams.entry(key.clone()).or_default();
            stream.publications.push(session_id);
            for subscription in &stream.subscriptions {
                subscription.add_image(DriverShared::image_info(session_id, stream_id));
            }
        }

        debug!(channel, stream_id, session = %session_id, "memory driver: publication added");
        Ok(Arc::new(MemoryPublication {
            driver: Arc::clone(&self.shared),
            key,
            session_id,
            closed: AtomicBool::new(false),
        }))
    }

    fn add_subscription(
        &self,
        channel: &str,
        stream_id: i32,
        listener: Arc<dyn ImageListener>,
    ) -> Result<Arc<dyn Subscription>, SubstrateError> {
        validate_channel(channel)?;
        let key = StreamKey {
            channel: channel.to_string(),
            stream_id,
        };
        let shared = Arc::new(SubscriptionShared {
            listener,
            closed: AtomicBool::new(false),
            images: Mutex::new(ImageTable::default()),
        });

        {
            let mut streams = self.shared.streams.lock();
            let stream = streams.entry(key.clone()).or_default();
            for &session_id in &stream.publications {
                shared.add_image(DriverShared::image_info(session_id, stream_id));
            }
            stream.subscriptions.push(Arc::clone(&shared));
        }

        debug!(channel, stream_id, "memory driver: subscription added");
        Ok(Arc::new(MemorySubscription {
            driver: Arc::clone(&self.shared),
            key,
            shared,
        }))
    }
}

struct MemoryImage {
    info: ImageInfo,
    fragments: VecDeque<(Bytes, FragmentFlags)>,
    closing: bool,
}

#[derive(Default)]
struct ImageTable {
    announced: VecDeque<ImageInfo>,
    images: Vec<MemoryImage>,
}

struct SubscriptionShared {
    listener: Arc<dyn ImageListener>,
    closed: AtomicBool,
    images: Mutex<ImageTable>,
}

impl SubscriptionShared {
    fn add_image(&self, info: ImageInfo) {
        let mut table = self.images.lock();
        if table
            .images
            .iter()
            .any(|image| image.info.session_id == info.session_id)
        {
            return;
        }
        table.announced.push_back(info.clone());
        table.images.push(MemoryImage {
            info,
            fragments: VecDeque::new(),
            closing: false,
        });
    }

    fn append(&self, session: SessionId, fragments: &[(Bytes, FragmentFlags)]) -> bool {
        let mut table = self.images.lock();
        match table
            .images
            .iter_mut()
            .find(|image| image.info.session_id == session && !image.closing)
        {
            Some(image) => {
                image.fragments.extend(fragments.iter().cloned());
                true
            }
            None => false,
        }
    }

    fn close_session(&self, session: SessionId) -> bool {
        let mut table = self.images.lock();
        let mut found = false;
        for image in table
            .images
            .iter_mut()
            .filter(|image| image.info.session_id == session && !image.closing)
        {
            image.closing = true;
            found = true;
        }
        found
    }

    fn has_image(&self, session: SessionId) -> bool {
        self.images
            .lock()
            .images
            .iter()
            .any(|image| image.info.session_id == session && !image.closing)
    }

    fn live_images(&self) -> usize {
        self.images
            .lock()
            .images
            .iter()
            .filter(|image| !image.closing)
            .count()
    }
}

fn fragment(message: &[u8], mtu: usize) -> Vec<(Bytes, FragmentFlags)> {
    if message.len() <= mtu {
        return vec![(Bytes::copy_from_slice(message), FragmentFlags::UNFRAGMENTED)];
    }
    let chunks = message.len().div_ceil(mtu);
    message
        .chunks(mtu)
        .enumerate()
        .map(|(i, chunk)| {
            let mut flags = FragmentFlags::NONE;
            if i == 0 {
                flags = flags | FragmentFlags::BEGIN;
            }
            if i + 1 == chunks {
                flags = flags | FragmentFlags::END;
            }
            (Bytes::copy_from_slice(chunk), flags)
        })
        .collect()
}

struct MemoryPublication {
    driver: Arc<DriverShared>,
    key: StreamKey,
    session_id: SessionId,
    closed: AtomicBool,
}

impl Publication for MemoryPublication {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn channel(&self) -> &str {
        &self.key.channel
    }

    fn stream_id(&self) -> i32 {
        self.key.stream_id
    }

    fn offer(&self, message: &[u8]) -> Result<(), OfferError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OfferError::Closed);
        }

        let mut streams = self.driver.streams.lock();
        let Some(stream) = streams.get_mut(&self.key) else {
            return Err(OfferError::NotConnected);
        };

        if let Some(fault) = stream.fault.as_mut() {
            fault.remaining -= 1;
            let error = fault.error;
            if fault.remaining == 0 {
                stream.fault = None;
            }
            trace!(session = %self.session_id, error = %error, "memory driver: injected offer failure");
            return Err(error);
        }

        if stream.subscriptions.is_empty() {
            return Err(OfferError::NotConnected);
        }

        let fragments = fragment(message, self.driver.mtu);
        let mut delivered = false;
        for subscription in &stream.subscriptions {
            delivered |= subscription.append(self.session_id, &fragments);
        }

        if delivered {
            Ok(())
        } else {
            Err(OfferError::NotConnected)
        }
    }

    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let streams = self.driver.streams.lock();
        streams.get(&self.key).is_some_and(|stream| {
            stream
                .subscriptions
                .iter()
                .any(|subscription| subscription.has_image(self.session_id))
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut streams = self.driver.streams.lock();
        if let Some(stream) = streams.get_mut(&self.key) {
            stream.publications.retain(|&session| session != self.session_id);
            for subscription in &stream.subscriptions {
                subscription.close_session(self.session_id);
            }
        }
        debug!(session = %self.session_id, channel = %self.key.channel, "memory driver: publication closed");
    }
}

impl Drop for MemoryPublication {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemorySubscription {
    driver: Arc<DriverShared>,
    key: StreamKey,
    shared: Arc<SubscriptionShared>,
}

impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.key.channel
    }

    fn stream_id(&self) -> i32 {
        self.key.stream_id
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut streams = self.driver.streams.lock();
        if let Some(stream) = streams.get_mut(&self.key) {
            stream
                .subscriptions
                .retain(|subscription| !Arc::ptr_eq(subscription, &self.shared));
        }
        debug!(channel = %self.key.channel, stream_id = self.key.stream_id, "memory driver: subscription closed");
    }

    fn poll(
        &self,
        handler: &mut dyn FnMut(&[u8], &FragmentHeader),
        limit: usize,
    ) -> Result<usize, SubstrateError> {
        if self.is_closed() {
            return Err(SubstrateError::Closed);
        }

        // Each event and fragment is taken under the table lock and handed
        // over without it: a handler may offer to a publication whose
        // subscriber is polled by another thread. Taking one at a time keeps
        // everything not yet delivered queued if a callback unwinds.
        loop {
            let Some(info) = self.shared.images.lock().announced.front().cloned() else {
                break;
            };
            self.shared.listener.on_available_image(&info);
            self.shared.images.lock().announced.pop_front();
        }

        let mut delivered = 0;
        while delivered < limit {
            let next = {
                let mut table = self.shared.images.lock();
                table.images.iter_mut().find_map(|image| {
                    image
                        .fragments
                        .pop_front()
                        .map(|(data, flags)| (image.info.session_id, data, flags))
                })
            };
            let Some((session_id, data, flags)) = next else {
                break;
            };
            delivered += 1;
            handler(&data, &FragmentHeader { session_id, flags });
        }

        // A drained closing image is removed only once its unavailability
        // has been reported.
        loop {
            let gone = self
                .shared
                .images
                .lock()
                .images
                .iter()
                .find(|image| image.closing && image.fragments.is_empty())
                .map(|image| image.info.clone());
            let Some(info) = gone else {
                break;
            };
            self.shared.listener.on_unavailable_image(&info);
            self.shared
                .images
                .lock()
                .images
                .retain(|image| image.info.session_id != info.session_id || !image.closing);
        }

        Ok(delivered)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.close();
    }
}
