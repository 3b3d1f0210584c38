use serde::{Deserialize, Serialize};

pub const FALLBACK_BIDDER_LABEL: &str = "User";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Merchant,
    Admin,
}

/// Identity of whoever is driving the client. Passed explicitly into every
/// cache, synchronizer and pipeline instead of living in ambient state.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub id_token: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id
            .as_deref()
            .map(|user_id| !user_id.trim().is_empty())
            .unwrap_or(false)
    }

    /// Name recorded on bid entries: display name, then email, then a fixed
    /// fallback.
    pub fn bidder_label(&self) -> String {
        [self.display_name.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or(FALLBACK_BIDDER_LABEL)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_session_is_not_authenticated() {
        let session = Session::anonymous();
        assert!(!session.is_authenticated());
        assert_eq!(session.role, Role::User);
    }

    #[test]
    fn bidder_label_falls_back_through_name_and_email() {
        let named = Session::authenticated("uid-1", "Jane Doe");
        assert_eq!(named.bidder_label(), "Jane Doe");

        let email_only = Session::authenticated("uid-2", "  ").with_email("bob@example.com");
        assert_eq!(email_only.bidder_label(), "bob@example.com");

        let bare = Session {
            user_id: Some("uid-3".to_string()),
            ..Session::default()
        };
        assert_eq!(bare.bidder_label(), FALLBACK_BIDDER_LABEL);
    }

    #[test]
    fn blank_user_id_does_not_count_as_signed_in() {
        let session = Session::authenticated("   ", "Ghost");
        assert!(!session.is_authenticated());
    }
}
