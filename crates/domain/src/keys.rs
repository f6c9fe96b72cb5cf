use std::fmt::{Display, Formatter};

use chatflow_core::{AppError, AppResult, NonEmptyString, TenantId};

const LEADER_KEY_PREFIX: &str = "worker:instance:lock";

/// Identity of one buffered conversation: a chat owned by one company.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    company_id: TenantId,
    chat_id: NonEmptyString,
}

impl ConversationKey {
    /// Creates a conversation key.
    pub fn new(company_id: TenantId, chat_id: impl Into<String>) -> AppResult<Self> {
        let chat_id = NonEmptyString::new(chat_id).map_err(|_| {
            AppError::Validation("conversation chat_id must not be empty".to_owned())
        })?;

        Ok(Self {
            company_id,
            chat_id,
        })
    }

    /// Returns the owning company.
    #[must_use]
    pub fn company_id(&self) -> TenantId {
        self.company_id
    }

    /// Returns the provider chat identifier.
    #[must_use]
    pub fn chat_id(&self) -> &str {
        self.chat_id.as_str()
    }

    /// Returns the resource id used for per-conversation locking.
    #[must_use]
    pub fn lock_id(&self) -> String {
        format!("{}:{}", self.company_id, self.chat_id)
    }
}

impl Display for ConversationKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.company_id, self.chat_id)
    }
}

/// Key layout for the debounce buffer under one prefix.
///
/// With the default `buf` prefix:
/// - entry list: `buf:list:<company>:<chat>`
/// - due index: `buf:due:zset` (members are entry list keys)
/// - pause marker: `buf:paused:<company>:<chat>`
/// - resource locks: `buf:lock:<company>:<chat>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationKeys {
    prefix: String,
}

impl CoordinationKeys {
    /// Creates a key layout for a validated prefix.
    pub fn new(prefix: impl Into<String>) -> AppResult<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(AppError::Validation(
                "coordination key prefix must not be empty".to_owned(),
            ));
        }

        if prefix.contains(':') {
            return Err(AppError::Validation(format!(
                "coordination key prefix '{prefix}' must not contain ':'"
            )));
        }

        Ok(Self { prefix })
    }

    /// Returns the prefix, which doubles as the resource lock namespace.
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    /// Returns the entry list key for one conversation.
    #[must_use]
    pub fn list_key(&self, conversation: &ConversationKey) -> String {
        format!("{}{conversation}", self.list_key_prefix())
    }

    /// Returns the prefix shared by every entry list key.
    #[must_use]
    pub fn list_key_prefix(&self) -> String {
        format!("{}:list:", self.prefix)
    }

    /// Returns the sorted set key holding due markers.
    #[must_use]
    pub fn due_index_key(&self) -> String {
        format!("{}:due:zset", self.prefix)
    }

    /// Returns the pause marker key for one conversation.
    #[must_use]
    pub fn pause_key(&self, conversation: &ConversationKey) -> String {
        format!("{}:paused:{conversation}", self.prefix)
    }

    /// Parses an entry list key back into its conversation.
    ///
    /// Chat ids may contain `:`; everything after the company segment belongs
    /// to the chat id.
    #[must_use]
    pub fn parse_list_key(&self, list_key: &str) -> Option<ConversationKey> {
        let remainder = list_key.strip_prefix(self.list_key_prefix().as_str())?;
        let (company_id, chat_id) = remainder.split_once(':')?;
        let company_id = TenantId::parse(company_id).ok()?;

        ConversationKey::new(company_id, chat_id).ok()
    }
}

impl Default for CoordinationKeys {
    fn default() -> Self {
        Self {
            prefix: "buf".to_owned(),
        }
    }
}

/// Returns the store key guarding one named resource.
#[must_use]
pub fn resource_lock_key(namespace: &str, resource_id: &str) -> String {
    format!("{namespace}:lock:{resource_id}")
}

/// Returns the single-instance key for one worker type.
#[must_use]
pub fn leader_lock_key(worker_type: &str) -> String {
    format!("{LEADER_KEY_PREFIX}:{worker_type}")
}

#[cfg(test)]
mod tests {
    use chatflow_core::TenantId;
    use proptest::prelude::*;

    use super::{ConversationKey, CoordinationKeys, leader_lock_key, resource_lock_key};

    fn conversation(chat_id: &str) -> ConversationKey {
        ConversationKey::new(TenantId::new(), chat_id).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn default_layout_matches_buffer_keys() {
        let keys = CoordinationKeys::default();
        let key = conversation("5511999999999@c.us");
        let company = key.company_id();

        assert_eq!(
            keys.list_key(&key),
            format!("buf:list:{company}:5511999999999@c.us")
        );
        assert_eq!(
            keys.pause_key(&key),
            format!("buf:paused:{company}:5511999999999@c.us")
        );
        assert_eq!(keys.due_index_key(), "buf:due:zset");
        assert_eq!(
            resource_lock_key("buf", key.lock_id().as_str()),
            format!("buf:lock:{company}:5511999999999@c.us")
        );
    }

    #[test]
    fn leader_key_is_scoped_by_worker_type() {
        assert_eq!(leader_lock_key("inbound"), "worker:instance:lock:inbound");
    }

    #[test]
    fn parse_list_key_keeps_colons_in_chat_id() {
        let keys = CoordinationKeys::default();
        let key = conversation("group:123:abc");

        let parsed = keys.parse_list_key(keys.list_key(&key).as_str());
        assert_eq!(parsed, Some(key));
    }

    #[test]
    fn parse_list_key_rejects_foreign_keys() {
        let keys = CoordinationKeys::default();
        assert!(keys.parse_list_key("buf:paused:x:y").is_none());
        assert!(keys.parse_list_key("other:list:x:y").is_none());
        assert!(keys.parse_list_key("buf:list:not-a-uuid:chat").is_none());
        assert!(
            keys.parse_list_key(format!("buf:list:{}", TenantId::new()).as_str())
                .is_none()
        );
    }

    #[test]
    fn prefix_validation_rejects_separator_and_blank() {
        assert!(CoordinationKeys::new("").is_err());
        assert!(CoordinationKeys::new("a:b").is_err());
        assert!(CoordinationKeys::new("inbound").is_ok());
    }

    #[test]
    fn empty_chat_id_is_rejected() {
        assert!(ConversationKey::new(TenantId::new(), "  ").is_err());
    }

    proptest! {
        #[test]
        fn list_key_round_trips_for_any_chat_id(chat_id in "[a-zA-Z0-9@._:-]{1,40}") {
            prop_assume!(!chat_id.trim().is_empty());
            let keys = CoordinationKeys::default();
            let key = ConversationKey::new(TenantId::new(), chat_id.as_str())
                .unwrap_or_else(|_| unreachable!());

            prop_assert_eq!(keys.parse_list_key(keys.list_key(&key).as_str()), Some(key));
        }
    }
}
