//! Active session lookup
//!
//! Actor and session ids are resolved when a record is persisted, not when it
//! is built. The service resolves them once per capture into a
//! [`SessionContext`] and hands that to the decorator.

use async_trait::async_trait;

/// The signed-in profile's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSession {
    /// Profile (actor) id
    pub uid: String,
    /// Session id
    pub sid: String,
}

/// The active group's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSession {
    pub gid: String,
}

/// Lookup of the currently active sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn active_profile_session(&self) -> anyhow::Result<Option<ProfileSession>>;

    async fn active_group_session(&self) -> anyhow::Result<Option<GroupSession>>;

    /// Channel the host app is currently bound to
    fn active_channel_id(&self) -> Option<String> {
        None
    }
}

/// Session state resolved for one capture call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub actor_id: String,
    pub session_id: String,
    pub group_id: Option<String>,
    pub channel_id: Option<String>,
}

impl SessionContext {
    /// Resolve both sessions concurrently
    ///
    /// Lookup failures degrade to an absent session rather than failing the
    /// capture.
    pub async fn resolve(provider: &dyn SessionProvider) -> Self {
        let (profile, group) = tokio::join!(
            provider.active_profile_session(),
            provider.active_group_session()
        );

        let profile = profile.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "profile session lookup failed");
            None
        });
        let group = group.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "group session lookup failed");
            None
        });

        let (actor_id, session_id) = match profile {
            Some(profile) => (profile.uid, profile.sid),
            None => {
                tracing::warn!("no active profile session; record will carry an empty actor id");
                (String::new(), String::new())
            }
        };

        Self {
            actor_id,
            session_id,
            group_id: group.map(|g| g.gid),
            channel_id: provider.active_channel_id(),
        }
    }
}
