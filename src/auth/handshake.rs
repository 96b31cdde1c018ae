//! Authentication handshake state machine
//!
//! The machine is pure: [`Handshake::step`] maps the current state and one
//! input to the next state plus the actions the connection driver must
//! perform. The driver owns the socket and the timer.

use crate::auth::Password;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a peer was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthFailure {
    Timeout,
    InvalidPassword,
}

impl AuthFailure {
    /// Reason code sent to the peer
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::Timeout => "TIMEOUT",
            AuthFailure::InvalidPassword => "INVALID_PASSWORD",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "TIMEOUT" => Some(AuthFailure::Timeout),
            "INVALID_PASSWORD" => Some(AuthFailure::InvalidPassword),
            _ => None,
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Timeout => write!(f, "authentication timed out"),
            AuthFailure::InvalidPassword => write!(f, "invalid password"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingPassword,
    Authorized,
    Rejected(AuthFailure),
    /// The peer went away before finishing
    Abandoned,
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthState::AwaitingPassword)
    }
}

/// Something that happened to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeInput {
    Password(String),
    TimerFired,
    PeerClosed,
}

/// What the driver must do next, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    SendReqAuth(bool),
    StartTimer,
    CancelTimer,
    SendAuth {
        authorized: bool,
        error: Option<AuthFailure>,
    },
    Close,
    Admit,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    state: AuthState,
    password: Option<Password>,
}

impl Handshake {
    /// Open the handshake for a fresh connection
    pub fn start(password: Option<Password>) -> (Self, Vec<HandshakeAction>) {
        let actions = match password {
            Some(_) => vec![HandshakeAction::SendReqAuth(true), HandshakeAction::StartTimer],
            None => vec![HandshakeAction::SendReqAuth(false)],
        };

        let machine = Self {
            state: AuthState::AwaitingPassword,
            password,
        };
        (machine, actions)
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn step(mut self, input: HandshakeInput) -> (Self, Vec<HandshakeAction>) {
        if self.state.is_terminal() {
            return (self, Vec::new());
        }

        let actions = match input {
            HandshakeInput::Password(given) => {
                match self.password.as_ref().map(|p| p.matches(&given)) {
                    // Without a secret the peer's acknowledgement is all we wait for
                    None => {
                        self.state = AuthState::Authorized;
                        vec![HandshakeAction::Admit]
                    }
                    Some(true) => {
                        self.state = AuthState::Authorized;
                        vec![
                            HandshakeAction::CancelTimer,
                            HandshakeAction::SendAuth {
                                authorized: true,
                                error: None,
                            },
                            HandshakeAction::Admit,
                        ]
                    }
                    Some(false) => self.reject(AuthFailure::InvalidPassword, true),
                }
            }
            HandshakeInput::TimerFired if self.password.is_some() => {
                self.reject(AuthFailure::Timeout, false)
            }
            HandshakeInput::TimerFired => Vec::new(),
            HandshakeInput::PeerClosed => {
                self.state = AuthState::Abandoned;
                let mut actions = Vec::new();
                if self.password.is_some() {
                    actions.push(HandshakeAction::CancelTimer);
                }
                actions.push(HandshakeAction::Close);
                actions
            }
        };

        (self, actions)
    }

    fn reject(&mut self, failure: AuthFailure, cancel_timer: bool) -> Vec<HandshakeAction> {
        self.state = AuthState::Rejected(failure);

        let mut actions = Vec::with_capacity(3);
        if cancel_timer {
            actions.push(HandshakeAction::CancelTimer);
        }
        actions.push(HandshakeAction::SendAuth {
            authorized: false,
            error: Some(failure),
        });
        actions.push(HandshakeAction::Close);
        actions
    }
}
