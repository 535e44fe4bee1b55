use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::wire::codec::{Codec, CodecError, Frame};
use crate::wire::envelope::Envelope;

pub mod auth;

pub const NOAUTH_USER: &str = "noauth";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated { user: String },
}

impl AuthState {
    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Unauthenticated => None,
            Self::Authenticated { user } => Some(user),
        }
    }
}

#[derive(Debug)]
pub enum SendError {
    Closed,
    Io(io::Error),
    Encode(CodecError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session transport is closed"),
            Self::Io(source) => write!(f, "failed to write frame: {source}"),
            Self::Encode(source) => write!(f, "failed to encode response: {source}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Transport half of a session. Implementations must tolerate concurrent
/// writers; a frame is written whole or not at all.
pub trait FrameSink: Send + Sync {
    fn write_frame(&self, frame: &Frame) -> Result<(), SendError>;
}

/// One client connection as seen by the dispatch layer.
///
/// The codec kept here is only a template: workers take their own
/// `codec_clone()` and never touch this instance. The auth state is written
/// exclusively by [`auth::AuthProtocol`].
pub struct Session {
    id: SessionId,
    codec_template: Mutex<Box<dyn Codec>>,
    sink: Arc<dyn FrameSink>,
    auth: Mutex<AuthState>,
    auth_failures: AtomicU32,
    in_flight: AtomicUsize,
}

impl Session {
    pub fn new(codec: Box<dyn Codec>, sink: Arc<dyn FrameSink>, initial: AuthState) -> Self {
        Self {
            id: SessionId::new(),
            codec_template: Mutex::new(codec),
            sink,
            auth: Mutex::new(initial),
            auth_failures: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn codec_clone(&self) -> Box<dyn Codec> {
        self.codec_template
            .lock()
            .expect("session codec lock poisoned")
            .duplicate()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.lock().expect("session auth lock poisoned").clone()
    }

    pub fn authenticated_user(&self) -> Option<String> {
        self.auth_state().user().map(str::to_owned)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user().is_some()
    }

    /// Requests handed to the pool and not yet finished by a worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn request_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn send(&self, codec: &mut dyn Codec, envelope: &Envelope) -> Result<(), SendError> {
        let frame = codec.encode(envelope).map_err(SendError::Encode)?;
        self.sink.write_frame(&frame)
    }

    /// Moves an unauthenticated session to `user`. Returns `false`, leaving
    /// the state untouched, when the session is already authenticated.
    fn try_authenticate(&self, user: String) -> bool {
        let mut auth = self.auth.lock().expect("session auth lock poisoned");
        if matches!(*auth, AuthState::Authenticated { .. }) {
            return false;
        }
        *auth = AuthState::Authenticated { user };
        true
    }

    fn record_auth_failure(&self) -> u32 {
        self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("auth", &self.auth_state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::{AuthState, FrameSink, SendError, Session};
    use crate::wire::codec::{Codec, CodecConfig, Frame, WireCodec};
    use crate::wire::envelope::{Envelope, MessageKind};

    /// Captures written frames and decodes them back for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) frames: Mutex<Vec<Frame>>,
        pub(crate) closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn envelopes(&self) -> Vec<Envelope> {
            let mut codec = WireCodec::new(CodecConfig::default());
            self.frames
                .lock()
                .expect("recording sink mutex poisoned")
                .iter()
                .map(|frame| codec.decode(frame).expect("recorded frame should decode"))
                .collect()
        }

        pub(crate) fn len(&self) -> usize {
            self.frames.lock().expect("recording sink mutex poisoned").len()
        }
    }

    impl FrameSink for RecordingSink {
        fn write_frame(&self, frame: &Frame) -> Result<(), SendError> {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(SendError::Closed);
            }
            self.frames
                .lock()
                .expect("recording sink mutex poisoned")
                .push(frame.clone());
            Ok(())
        }
    }

    pub(crate) fn recording_session(initial: AuthState) -> (Arc<Session>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let session = Session::new(
            Box::new(WireCodec::new(CodecConfig::default())),
            sink.clone(),
            initial,
        );
        (Arc::new(session), sink)
    }

    #[test]
    fn send_encodes_with_the_given_codec_clone() {
        let (session, sink) = recording_session(AuthState::Unauthenticated);
        let mut codec = session.codec_clone();

        session
            .send(codec.as_mut(), &Envelope::pong(9))
            .expect("send should succeed");

        let sent = sink.envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Pong);
        assert_eq!(sent[0].id, 9);
    }

    #[test]
    fn closed_sink_reports_send_error() {
        let (session, sink) = recording_session(AuthState::Unauthenticated);
        sink.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        let mut codec = session.codec_clone();

        let err = session
            .send(codec.as_mut(), &Envelope::pong(1))
            .expect_err("closed sink should fail");
        assert!(matches!(err, SendError::Closed));
    }

    #[test]
    fn sessions_get_distinct_ids_and_keep_initial_state() {
        let (first, _) = recording_session(AuthState::Unauthenticated);
        let (second, _) = recording_session(AuthState::Authenticated {
            user: "noauth".to_owned(),
        });

        assert_ne!(first.id(), second.id());
        assert!(!first.is_authenticated());
        assert_eq!(second.authenticated_user().as_deref(), Some("noauth"));
    }
}
