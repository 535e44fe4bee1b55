use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha512};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::wire::envelope::{Envelope, MessageKind};
use crate::wire::session::{AuthState, Session, NOAUTH_USER};

pub const USERNAME_PARAMETER: &str = "username";
pub const PASSWORD_PARAMETER: &str = "password";

const USER_LINE_SEPARATOR: char = '=';
const SALT_SEPARATOR: char = ':';

/// Pluggable credential check. `verify` returns the authenticated user name.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, request: &Envelope) -> Option<String>;
    fn challenge(&self) -> Option<Envelope>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengePolicy {
    EveryFailure,
    FirstFailure,
    Never,
}

impl ChallengePolicy {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "every_failure" => Some(Self::EveryFailure),
            "first_failure" => Some(Self::FirstFailure),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    fn allows(self, failure_count: u32) -> bool {
        match self {
            Self::EveryFailure => true,
            Self::FirstFailure => failure_count <= 1,
            Self::Never => false,
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    UsersFileRead { path: String, source: io::Error },
    MalformedUserLine { line: usize },
    UnknownChallengePolicy { value: String },
    MissingUsersFile,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsersFileRead { path, source } => {
                write!(f, "failed to read users file '{path}': {source}")
            }
            Self::MalformedUserLine { line } => {
                write!(f, "users file line {line} must look like name=salt:hash")
            }
            Self::UnknownChallengePolicy { value } => write!(
                f,
                "unknown auth.rechallenge '{value}', expected every_failure, first_failure or never"
            ),
            Self::MissingUsersFile => {
                write!(f, "auth.enabled requires auth.users_file to be set")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Session authentication state machine.
///
/// Without a verifier every session starts authenticated as `noauth`.
/// With one, sessions start unauthenticated and only an `AUTHENTICATE`
/// request accepted by the verifier moves them forward; there is no way back.
pub struct AuthProtocol {
    verifier: Option<Arc<dyn AuthVerifier>>,
    policy: ChallengePolicy,
    logger: Arc<Logger>,
}

impl AuthProtocol {
    pub fn new(
        verifier: Option<Arc<dyn AuthVerifier>>,
        policy: ChallengePolicy,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            verifier,
            policy,
            logger,
        }
    }

    pub fn disabled(logger: Arc<Logger>) -> Self {
        Self::new(None, ChallengePolicy::EveryFailure, logger)
    }

    pub fn from_app_config(app_config: &AppConfig, logger: Arc<Logger>) -> Result<Self, AuthError> {
        let policy = ChallengePolicy::from_config_value(&app_config.auth.rechallenge).ok_or_else(
            || AuthError::UnknownChallengePolicy {
                value: app_config.auth.rechallenge.clone(),
            },
        )?;

        if !app_config.auth.enabled {
            return Ok(Self::new(None, policy, logger));
        }

        let users_file = app_config.auth.users_file.trim();
        if users_file.is_empty() {
            return Err(AuthError::MissingUsersFile);
        }

        let mut verifier = PasswordFileVerifier::from_file(Path::new(users_file))?;
        let challenge = app_config.auth.challenge.trim();
        if !challenge.is_empty() {
            verifier = verifier.with_challenge(challenge);
        }
        logger.log(
            LogLevel::Info,
            Some("wire::session::auth"),
            "Loaded users file",
            Some(json!({
                "path": users_file,
                "users": verifier.user_count(),
                "challenge": !challenge.is_empty(),
            })),
        );
        Ok(Self::new(Some(Arc::new(verifier)), policy, logger))
    }

    pub fn requires_auth(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn initial_state(&self) -> AuthState {
        if self.requires_auth() {
            AuthState::Unauthenticated
        } else {
            AuthState::Authenticated {
                user: NOAUTH_USER.to_owned(),
            }
        }
    }

    /// Envelope to push to a freshly opened session, if any.
    pub fn on_connect(&self) -> Option<Envelope> {
        self.verifier.as_ref().and_then(|verifier| verifier.challenge())
    }

    pub fn authenticate(&self, session: &Session, request: &Envelope) -> Vec<Envelope> {
        let Some(verifier) = self.verifier.as_ref() else {
            session.try_authenticate(NOAUTH_USER.to_owned());
            return vec![already_authenticated(request.id)];
        };

        if session.is_authenticated() {
            return vec![already_authenticated(request.id)];
        }

        match verifier.verify(request) {
            Some(user) => {
                // Another worker may have finished a login for this session
                // while the verifier ran.
                if !session.try_authenticate(user.clone()) {
                    return vec![already_authenticated(request.id)];
                }
                self.logger.log(
                    LogLevel::Info,
                    Some("wire::session::auth"),
                    "Session authenticated",
                    Some(json!({"session_id": session.id().to_string(), "user": user})),
                );
                vec![Envelope::success(request.id)]
            }
            None => {
                let failures = session.record_auth_failure();
                self.logger.log(
                    LogLevel::Warn,
                    Some("wire::session::auth"),
                    "Authentication failed",
                    Some(json!({
                        "session_id": session.id().to_string(),
                        "user": request.string_parameter(USERNAME_PARAMETER),
                        "failures": failures,
                    })),
                );

                let mut responses = vec![Envelope::error(request.id, "authentication failure")];
                if self.policy.allows(failures) {
                    responses.extend(verifier.challenge());
                }
                responses
            }
        }
    }
}

fn already_authenticated(id: i64) -> Envelope {
    Envelope::error(id, "already authenticated")
}

pub fn hash_text(text: &str) -> String {
    hex::encode(Sha512::digest(text.as_bytes()))
}

/// `H(salt + H(user + password))`, the stored half of a `salt:hash` entry.
pub fn scramble(user: &str, clear_text: &str, salt: &str) -> String {
    hash_with_salt(salt, &hash_text(&format!("{user}{clear_text}")))
}

/// Produces a complete `salt:hash` users file value with a fresh salt.
pub fn scramble_with_new_salt(user: &str, clear_text: &str) -> String {
    let salt = Uuid::new_v4().to_string();
    let hash = scramble(user, clear_text, &salt);
    format!("{salt}{SALT_SEPARATOR}{hash}")
}

fn hash_with_salt(salt: &str, hashed: &str) -> String {
    hash_text(&format!("{salt}{hashed}"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StoredCredential {
    salt: String,
    hash: String,
}

/// Verifier backed by a users file of `name=salt:hash` lines.
///
/// Clients send either the clear-text password or the pre-hashed
/// `H(username + password)`; both are accepted.
#[derive(Debug)]
pub struct PasswordFileVerifier {
    credentials: HashMap<String, StoredCredential>,
    challenge: Option<String>,
}

impl PasswordFileVerifier {
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let content = fs::read_to_string(path).map_err(|source| AuthError::UsersFileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AuthError> {
        let mut credentials = HashMap::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (user, stored) = line
                .split_once(USER_LINE_SEPARATOR)
                .ok_or(AuthError::MalformedUserLine { line: index + 1 })?;
            let (salt, hash) = stored
                .split_once(SALT_SEPARATOR)
                .ok_or(AuthError::MalformedUserLine { line: index + 1 })?;

            credentials.insert(
                user.to_owned(),
                StoredCredential {
                    salt: salt.to_owned(),
                    hash: hash.to_owned(),
                },
            );
        }

        Ok(Self {
            credentials,
            challenge: None,
        })
    }

    /// Sends `message` as an `AUTHENTICATE` envelope (id 0) on connect and
    /// after failures.
    pub fn with_challenge(mut self, message: impl Into<String>) -> Self {
        self.challenge = Some(message.into());
        self
    }

    pub fn user_count(&self) -> usize {
        self.credentials.len()
    }

    fn matches(&self, user: &str, password: &str) -> bool {
        let Some(stored) = self.credentials.get(user) else {
            return false;
        };

        hash_with_salt(&stored.salt, password) == stored.hash
            || scramble(user, password, &stored.salt) == stored.hash
    }
}

impl AuthVerifier for PasswordFileVerifier {
    fn verify(&self, request: &Envelope) -> Option<String> {
        if request.kind != MessageKind::Authenticate {
            return None;
        }

        let user = request.string_parameter(USERNAME_PARAMETER)?;
        let password = request.string_parameter(PASSWORD_PARAMETER)?;
        self.matches(user, password).then(|| user.to_owned())
    }

    fn challenge(&self) -> Option<Envelope> {
        self.challenge
            .as_ref()
            .map(|message| Envelope::new(0, MessageKind::Authenticate).with_payload(message.as_str()))
    }
}
