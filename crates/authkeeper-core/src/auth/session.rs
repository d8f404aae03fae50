//! Per-connection handshake state.
//!
//! A [`ClientSession`] belongs to exactly one connection and is only ever
//! touched through `&mut`, so a nonce or SASL conversation can never leak to
//! another connection. Nothing here is persisted.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::authz::session::AuthorizationSession;

use super::sasl::SaslSession;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection is in an authentication handshake.
#[derive(Debug, Default)]
pub enum HandshakeState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// `getnonce` was answered; the next `authenticate` consumes this.
    NoncePending { nonce: String },
    /// A SASL conversation is in progress.
    Sasl {
        conversation_id: u32,
        session: Box<SaslSession>,
    },
}

/// State owned by one client connection.
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    handshake: HandshakeState,
    next_conversation_id: u32,
    /// Users logged in on this connection.
    pub authz: AuthorizationSession,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            handshake: HandshakeState::Idle,
            next_conversation_id: 1,
            authz: AuthorizationSession::new(),
        }
    }

    /// Process-unique connection id, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn handshake(&self) -> &HandshakeState {
        &self.handshake
    }

    /// Remember a nonce, replacing any handshake in progress.
    pub fn set_pending_nonce(&mut self, nonce: String) {
        self.handshake = HandshakeState::NoncePending { nonce };
    }

    /// Take the pending nonce, if there is one. A SASL conversation in
    /// progress is left alone.
    pub fn take_pending_nonce(&mut self) -> Option<String> {
        match std::mem::take(&mut self.handshake) {
            HandshakeState::NoncePending { nonce } => Some(nonce),
            other => {
                self.handshake = other;
                None
            }
        }
    }

    /// Reserve the id of the next SASL conversation. Never zero.
    pub fn allocate_conversation_id(&mut self) -> u32 {
        let conversation_id = self.next_conversation_id;
        self.next_conversation_id = self.next_conversation_id.wrapping_add(1).max(1);
        conversation_id
    }

    /// Start tracking a SASL conversation and return its id.
    pub fn begin_sasl(&mut self, session: SaslSession) -> u32 {
        let conversation_id = self.allocate_conversation_id();
        self.resume_sasl(conversation_id, session);
        conversation_id
    }

    /// Take the SASL conversation with the given id. A mismatching id leaves
    /// the current state untouched.
    pub fn take_sasl(&mut self, conversation_id: u32) -> Option<SaslSession> {
        match std::mem::take(&mut self.handshake) {
            HandshakeState::Sasl {
                conversation_id: current,
                session,
            } if current == conversation_id => Some(*session),
            other => {
                self.handshake = other;
                None
            }
        }
    }

    /// Put a conversation back after a step that needs another round trip.
    pub fn resume_sasl(&mut self, conversation_id: u32, session: SaslSession) {
        self.handshake = HandshakeState::Sasl {
            conversation_id,
            session: Box::new(session),
        };
    }

    /// Forget any handshake in progress.
    pub fn reset_handshake(&mut self) {
        self.handshake = HandshakeState::Idle;
    }
}
