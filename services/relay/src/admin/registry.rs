//! In-memory administrative state: users and the dissector flag.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tproxy_admin_proto::Token;

/// Name of the admin user seeded from the configured token.
pub const BOOTSTRAP_ADMIN: &str = "admin";

/// Registry mutations that were refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user {0:?} already exists")]
    UserExists(String),

    #[error("user {0:?} does not exist")]
    UnknownUser(String),

    #[error("cannot remove the last admin user")]
    LastAdmin,
}

#[derive(Debug, Default)]
struct Inner {
    proxy_users: BTreeMap<String, String>,
    admin_users: BTreeMap<String, Token>,
    dissector_enabled: bool,
}

/// Users and flags managed through the administrative protocol.
#[derive(Debug)]
pub struct AdminRegistry {
    inner: Mutex<Inner>,
}

impl AdminRegistry {
    /// Create a registry whose only admin user is [`BOOTSTRAP_ADMIN`].
    pub fn new(admin_token: Token) -> Self {
        let mut inner = Inner::default();
        inner
            .admin_users
            .insert(BOOTSTRAP_ADMIN.to_string(), admin_token);
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a single map operation; poisoning is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `token` belongs to an admin user.
    pub fn authorize(&self, token: &Token) -> bool {
        self.lock().admin_users.values().any(|t| t == token)
    }

    pub fn dissector_enabled(&self) -> bool {
        self.lock().dissector_enabled
    }

    pub fn set_dissector(&self, enabled: bool) {
        self.lock().dissector_enabled = enabled;
    }

    /// Proxy user names in sorted order.
    pub fn proxy_users(&self) -> Vec<String> {
        self.lock().proxy_users.keys().cloned().collect()
    }

    /// Admin user names in sorted order.
    pub fn admin_users(&self) -> Vec<String> {
        self.lock().admin_users.keys().cloned().collect()
    }

    pub fn add_proxy_user(&self, username: &str, password: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.proxy_users.contains_key(username) {
            return Err(RegistryError::UserExists(username.to_string()));
        }
        inner
            .proxy_users
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    pub fn add_admin_user(&self, username: &str, token: Token) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.admin_users.contains_key(username) {
            return Err(RegistryError::UserExists(username.to_string()));
        }
        inner.admin_users.insert(username.to_string(), token);
        Ok(())
    }

    pub fn del_proxy_user(&self, username: &str) -> Result<(), RegistryError> {
        self.lock()
            .proxy_users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownUser(username.to_string()))
    }

    /// Remove an admin user. The last one can never be removed.
    pub fn del_admin_user(&self, username: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if !inner.admin_users.contains_key(username) {
            return Err(RegistryError::UnknownUser(username.to_string()));
        }
        if inner.admin_users.len() == 1 {
            return Err(RegistryError::LastAdmin);
        }
        inner.admin_users.remove(username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(fill: u8) -> Token {
        Token::new([fill; tproxy_admin_proto::TOKEN_LEN])
    }

    #[test]
    fn test_bootstrap_admin_authorizes() {
        let registry = AdminRegistry::new(token(b'a'));
        assert!(registry.authorize(&token(b'a')));
        assert!(!registry.authorize(&token(b'b')));
        assert_eq!(registry.admin_users(), vec![BOOTSTRAP_ADMIN.to_string()]);
    }

    #[test]
    fn test_proxy_users_add_and_remove() {
        let registry = AdminRegistry::new(token(b'a'));
        registry.add_proxy_user("bob", "secret").unwrap();
        registry.add_proxy_user("alice", "hunter2").unwrap();
        assert_eq!(registry.proxy_users(), vec!["alice", "bob"]);

        assert_eq!(
            registry.add_proxy_user("bob", "other"),
            Err(RegistryError::UserExists("bob".to_string()))
        );

        registry.del_proxy_user("bob").unwrap();
        assert_eq!(
            registry.del_proxy_user("bob"),
            Err(RegistryError::UnknownUser("bob".to_string()))
        );
        assert_eq!(registry.proxy_users(), vec!["alice"]);
    }

    #[test]
    fn test_new_admin_token_authorizes() {
        let registry = AdminRegistry::new(token(b'a'));
        registry.add_admin_user("ops", token(b'o')).unwrap();
        assert!(registry.authorize(&token(b'o')));

        registry.del_admin_user("ops").unwrap();
        assert!(!registry.authorize(&token(b'o')));
    }

    #[test]
    fn test_last_admin_cannot_be_removed() {
        let registry = AdminRegistry::new(token(b'a'));
        assert_eq!(
            registry.del_admin_user(BOOTSTRAP_ADMIN),
            Err(RegistryError::LastAdmin)
        );

        registry.add_admin_user("ops", token(b'o')).unwrap();
        registry.del_admin_user(BOOTSTRAP_ADMIN).unwrap();
        assert!(!registry.authorize(&token(b'a')));
        assert_eq!(
            registry.del_admin_user("ops"),
            Err(RegistryError::LastAdmin)
        );
    }

    #[test]
    fn test_dissector_toggle() {
        let registry = AdminRegistry::new(token(b'a'));
        assert!(!registry.dissector_enabled());
        registry.set_dissector(true);
        assert!(registry.dissector_enabled());
    }
}
