use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Char-boundary-safe log prefix. Ids are caller-supplied and may contain
// multi-byte characters; a raw byte slice would panic on them.
pub fn short_id(id: &str) -> &str {
    let mut end = id.len().min(8);
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Valid,
    Invalid,
    RateLimited,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    CookieOnly,
    OauthOnly,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    // Unix seconds. None means the upstream did not report an expiry.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl OAuthToken {
    pub fn expires_within(&self, secs: i64, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - now.timestamp() < secs,
            None => false,
        }
    }
}

// One credentialed Claude.ai identity. The registry owns every mutation;
// sessions refer to accounts by organization_uuid only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub organization_uuid: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub cookie_value: Option<String>,
    #[serde(default)]
    pub oauth_token: Option<OAuthToken>,
    pub auth_type: AuthType,
    #[serde(default)]
    pub status: AccountStatus,
    // Set while status == RateLimited; selection resumes once this passes.
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
    // Short exclusion after an upstream overload report.
    #[serde(default)]
    pub overloaded_until: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,
}

impl Account {
    pub fn new(
        organization_uuid: String,
        cookie_value: Option<String>,
        oauth_token: Option<OAuthToken>,
        capabilities: Vec<String>,
    ) -> Self {
        let auth_type = match (&cookie_value, &oauth_token) {
            (Some(_), Some(_)) => AuthType::Both,
            (Some(_), None) => AuthType::CookieOnly,
            _ => AuthType::OauthOnly,
        };
        Self {
            organization_uuid,
            capabilities,
            cookie_value,
            oauth_token,
            auth_type,
            status: AccountStatus::Valid,
            resets_at: None,
            overloaded_until: None,
            last_used: Utc::now(),
        }
    }

    pub fn can_oauth(&self) -> bool {
        matches!(self.auth_type, AuthType::OauthOnly | AuthType::Both) && self.oauth_token.is_some()
    }

    pub fn can_web(&self) -> bool {
        matches!(self.auth_type, AuthType::CookieOnly | AuthType::Both)
            && self.cookie_value.is_some()
    }

    pub fn is_pro(&self) -> bool {
        self.capabilities.iter().any(|c| c == "claude_pro")
    }

    pub fn is_max(&self) -> bool {
        self.capabilities.iter().any(|c| c == "claude_max")
    }

    pub fn is_overloaded(&self, now: DateTime<Utc>) -> bool {
        matches!(self.overloaded_until, Some(until) if until > now)
    }

    // Short prefix used in logs; full uuids and cookies never hit the log.
    pub fn short_id(&self) -> &str {
        short_id(&self.organization_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie_account(id: &str) -> Account {
        Account::new(id.to_string(), Some("sessionKey=abc".into()), None, vec![])
    }

    #[test]
    fn auth_type_derived_from_credentials() {
        let a = cookie_account("org-1");
        assert_eq!(a.auth_type, AuthType::CookieOnly);
        assert!(a.can_web());
        assert!(!a.can_oauth());

        let b = Account::new(
            "org-2".into(),
            None,
            Some(OAuthToken {
                access_token: "tok".into(),
                refresh_token: Some("ref".into()),
                expires_at: None,
            }),
            vec![],
        );
        assert_eq!(b.auth_type, AuthType::OauthOnly);
        assert!(b.can_oauth());
        assert!(!b.can_web());
    }

    #[test]
    fn overload_window_is_time_bounded() {
        let mut a = cookie_account("org-3");
        let now = Utc::now();
        assert!(!a.is_overloaded(now));
        a.overloaded_until = Some(now + chrono::Duration::seconds(30));
        assert!(a.is_overloaded(now));
        assert!(!a.is_overloaded(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn token_expiry_window() {
        let token = OAuthToken {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(Utc::now().timestamp() + 100),
        };
        assert!(token.expires_within(300, Utc::now()));
        assert!(!token.expires_within(50, Utc::now()));
    }

    #[test]
    fn short_id_respects_char_boundaries() {
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
        // 3-byte chars: byte 8 falls mid-char, truncation backs off.
        let id = "日本語のアカウント";
        let prefix = short_id(id);
        assert!(id.starts_with(prefix));
        assert!(prefix.len() <= 8);
        // 2-byte chars crossing the 8-byte mark must not panic either.
        let id = "орг-аккаунт";
        let _ = short_id(id);
    }

    #[test]
    fn persisted_form_round_trips() {
        let a = cookie_account("org-4");
        let json = serde_json::to_string(&a).unwrap();
        let back: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(back.organization_uuid, "org-4");
        assert_eq!(back.status, AccountStatus::Valid);
    }
}
