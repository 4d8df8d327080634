//! The session context passed into every engine call.

use prv_core::PeerId;

/// Who is acting.
///
/// The engine keeps no notion of a current user; callers hand this in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Our profile id, the `sender` of every PDU we produce.
    pub profile: PeerId,

    /// Name shown to peers in handshake requests.
    pub display_name: String,

    pub email: Option<String>,
}

impl SessionContext {
    pub fn new(profile: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            display_name: display_name.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}
