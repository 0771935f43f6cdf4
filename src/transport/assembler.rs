//! Fragment reassembly.
//!
//! One assembler per subscription. Each image session keeps its own partial
//! buffer, so interleaved fragments from different publications never mix.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::core::{AssemblerError, SessionId};
use crate::substrate::FragmentHeader;

#[derive(Debug, Default)]
struct Partial {
    buf: BytesMut,
    in_progress: bool,
}

impl Partial {
    fn reset(&mut self) {
        self.buf.clear();
        self.in_progress = false;
    }
}

/// Rebuilds complete messages from BEGIN/END fragment sequences.
#[derive(Debug)]
pub struct FragmentAssembler {
    max_message_length: usize,
    sessions: HashMap<SessionId, Partial>,
}

impl FragmentAssembler {
    /// Create an assembler that rejects messages above `max_message_length`.
    pub fn new(max_message_length: usize) -> Self {
        Self {
            max_message_length,
            sessions: HashMap::new(),
        }
    }

    /// Feed one fragment; `deliver` is called when a message completes.
    ///
    /// Unfragmented fragments are passed through without copying. On error
    /// the session's partial message is discarded and the next BEGIN starts
    /// over.
    pub fn on_fragment<F>(
        &mut self,
        data: &[u8],
        header: &FragmentHeader,
        mut deliver: F,
    ) -> Result<(), AssemblerError>
    where
        F: FnMut(SessionId, &[u8]),
    {
        let session = header.session_id;
        let flags = header.flags;

        if flags.is_unfragmented() {
            if data.len() > self.max_message_length {
                return Err(AssemblerError::MessageTooLarge {
                    session,
                    length: data.len(),
                    limit: self.max_message_length,
                });
            }
            deliver(session, data);
            return Ok(());
        }

        let partial = self.sessions.entry(session).or_default();

        if flags.is_begin() {
            partial.reset();
            partial.in_progress = true;
        } else if !partial.in_progress {
            return Err(AssemblerError::MissingBegin { session });
        }

        let length = partial.buf.len() + data.len();
        if length > self.max_message_length {
            partial.reset();
            return Err(AssemblerError::MessageTooLarge {
                session,
                length,
                limit: self.max_message_length,
            });
        }
        partial.buf.extend_from_slice(data);

        if flags.is_end() {
            deliver(session, &partial.buf);
            partial.reset();
        }
        Ok(())
    }

    /// Drop any partial message for `session`.
    pub fn remove_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
    }

    /// Sessions with buffer state.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
