//! Inbound registry
//!
//! Validates and persists inbound mutations and produces the snapshot the
//! engine configuration is built from. The registry never restarts the
//! engine; callers mark the restart coordinator dirty after a successful
//! mutation.

use crate::config::{OwnerMatch, ProvisioningPolicy};
use crate::error::{Error, Result};
use crate::inbound::{derive_tag, Inbound, InboundUpdate, NewInbound, NewUser, Role, User, TAG_PREFIX};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Setting key holding a JSON template that replaces the engine's base config
pub const ENGINE_TEMPLATE_KEY: &str = "engine_template";

/// Durable storage consumed by the registry
pub trait ConfigStore: Send + Sync {
    /// All inbounds, or only those owned by `owner`, ordered by id
    fn list_inbounds(&self, owner: Option<i64>) -> Result<Vec<Inbound>>;
    fn get_inbound(&self, id: i64) -> Result<Option<Inbound>>;
    fn find_enabled_by_port(&self, port: u16) -> Result<Option<Inbound>>;
    /// Persist a new inbound, ignoring its id; returns the assigned id
    fn insert_inbound(&self, inbound: &Inbound) -> Result<i64>;
    fn update_inbound(&self, inbound: &Inbound) -> Result<()>;
    fn delete_inbound(&self, id: i64) -> Result<bool>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn insert_user(&self, user: &NewUser) -> Result<User>;
    fn delete_user(&self, id: i64) -> Result<bool>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
}

/// Which owner-resolution branch ran for an added inbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OwnerResolution {
    /// A viewer account was created for the label and owns the inbound
    Provisioned { user_id: i64 },
    /// An account matching the label exists; the acting administrator owns the inbound
    ExistingAccount { user_id: i64 },
    /// Provisioning is disabled or the label is empty
    Skipped,
    /// Provisioning failed; the acting administrator owns the inbound
    Failed { reason: String },
}

/// Result of a successful add
#[derive(Debug, Clone, Serialize)]
pub struct AddedInbound {
    pub inbound: Inbound,
    pub owner: OwnerResolution,
}

pub struct InboundRegistry {
    store: Arc<dyn ConfigStore>,
    policy: ProvisioningPolicy,
}

impl InboundRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, policy: ProvisioningPolicy) -> Self {
        Self { store, policy }
    }

    /// List inbounds ordered by id, optionally only those owned by `owner`
    pub fn list(&self, owner: Option<i64>) -> Result<Vec<Inbound>> {
        self.store.list_inbounds(owner)
    }

    pub fn get(&self, id: i64) -> Result<Inbound> {
        self.store
            .get_inbound(id)?
            .ok_or_else(|| Error::NotFound(format!("inbound {}", id)))
    }

    /// Inbounds the engine should serve
    pub fn enabled_inbounds(&self) -> Result<Vec<Inbound>> {
        Ok(self
            .store
            .list_inbounds(None)?
            .into_iter()
            .filter(|inbound| inbound.enable)
            .collect())
    }

    /// Template override stored in the settings table, if any
    pub fn engine_template(&self) -> Result<Option<Value>> {
        match self.store.get_setting(ENGINE_TEMPLATE_KEY)? {
            None => Ok(None),
            Some(text) if text.trim().is_empty() => Ok(None),
            Some(text) => parse_engine_template(&text).map(Some),
        }
    }

    /// Add an inbound on behalf of `actor`
    pub fn add(&self, actor: &User, new: NewInbound) -> Result<AddedInbound> {
        new.protocol.validate()?;
        if new.port == 0 {
            return Err(Error::InvalidConfig("port must be greater than 0".to_string()));
        }
        self.ensure_port_free(new.port, None)?;

        let tag = match new.tag {
            Some(tag) if !tag.trim().is_empty() => tag,
            _ => derive_tag(new.port),
        };

        let owner = self.resolve_owner(actor, &new.remark);
        let user_id = match owner {
            OwnerResolution::Provisioned { user_id } => user_id,
            _ => actor.id,
        };

        let mut inbound = Inbound {
            id: 0,
            user_id,
            remark: new.remark,
            enable: true,
            listen: new.listen.filter(|l| !l.is_empty()),
            port: new.port,
            protocol: new.protocol,
            stream_settings: new.stream_settings,
            sniffing: new.sniffing,
            tag,
        };

        match self.store.insert_inbound(&inbound) {
            Ok(id) => inbound.id = id,
            Err(e) => {
                if let OwnerResolution::Provisioned { user_id } = owner {
                    self.discard_provisioned(user_id);
                }
                return Err(e);
            }
        }

        info!(
            id = inbound.id,
            port = inbound.port,
            tag = %inbound.tag,
            owner = inbound.user_id,
            "Inbound added"
        );
        Ok(AddedInbound { inbound, owner })
    }

    /// Apply a partial update to an existing inbound
    pub fn update(&self, id: i64, update: InboundUpdate) -> Result<Inbound> {
        let mut inbound = self.get(id)?;

        if let Some(remark) = update.remark {
            inbound.remark = remark;
        }
        if let Some(enable) = update.enable {
            inbound.enable = enable;
        }
        if let Some(listen) = update.listen {
            inbound.listen = Some(listen).filter(|l| !l.is_empty());
        }
        let port_changed = matches!(update.port, Some(port) if port != inbound.port);
        if let Some(port) = update.port {
            if port == 0 {
                return Err(Error::InvalidConfig("port must be greater than 0".to_string()));
            }
            inbound.port = port;
        }
        if let Some(protocol) = update.protocol {
            protocol.validate()?;
            inbound.protocol = protocol;
        }
        if let Some(stream_settings) = update.stream_settings {
            inbound.stream_settings = Some(stream_settings).filter(|v| !v.is_null());
        }
        if let Some(sniffing) = update.sniffing {
            inbound.sniffing = Some(sniffing).filter(|v| !v.is_null());
        }
        match update.tag {
            Some(tag) if !tag.trim().is_empty() => inbound.tag = tag,
            Some(_) => inbound.tag = derive_tag(inbound.port),
            // A derived tag follows the port
            None if port_changed && inbound.tag.starts_with(TAG_PREFIX) => {
                inbound.tag = derive_tag(inbound.port)
            }
            None => {}
        }

        if inbound.enable {
            self.ensure_port_free(inbound.port, Some(id))?;
        }

        self.store.update_inbound(&inbound)?;
        info!(id, port = inbound.port, tag = %inbound.tag, enable = inbound.enable, "Inbound updated");
        Ok(inbound)
    }

    /// Remove an inbound permanently
    pub fn delete(&self, id: i64) -> Result<()> {
        if !self.store.delete_inbound(id)? {
            return Err(Error::NotFound(format!("inbound {}", id)));
        }
        info!(id, "Inbound deleted");
        Ok(())
    }

    /// Advisory check; the store's unique index is authoritative
    fn ensure_port_free(&self, port: u16, exclude_id: Option<i64>) -> Result<()> {
        match self.store.find_enabled_by_port(port)? {
            Some(existing) if Some(existing.id) != exclude_id => Err(Error::Conflict(format!(
                "port {} is already used by inbound {}",
                port, existing.id
            ))),
            _ => Ok(()),
        }
    }

    /// Best-effort account provisioning; never fails the add
    fn resolve_owner(&self, actor: &User, label: &str) -> OwnerResolution {
        if !self.policy.enabled || label.trim().is_empty() {
            return OwnerResolution::Skipped;
        }

        let existing = match self.store.find_user_by_username(label) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(label, error = %e, "Account lookup failed, inbound owned by acting user");
                return OwnerResolution::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(user) = existing.filter(|user| self.matches_label(user)) {
            debug!(label, user_id = user.id, acting = actor.id, "Account exists for label");
            return OwnerResolution::ExistingAccount { user_id: user.id };
        }

        let new_user = NewUser {
            username: label.to_string(),
            password: self.policy.default_password.clone(),
            role: Role::Viewer,
        };
        match self.store.insert_user(&new_user) {
            Ok(user) => {
                info!(label, user_id = user.id, "Provisioned viewer account for inbound");
                OwnerResolution::Provisioned { user_id: user.id }
            }
            Err(e) => {
                warn!(label, error = %e, "Viewer provisioning failed, inbound owned by acting user");
                OwnerResolution::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn matches_label(&self, user: &User) -> bool {
        match self.policy.owner_match {
            OwnerMatch::Username => true,
            OwnerMatch::UsernameAndPassword => user.password_matches(&self.policy.default_password),
        }
    }

    fn discard_provisioned(&self, user_id: i64) {
        if let Err(e) = self.store.delete_user(user_id) {
            warn!(user_id, error = %e, "Failed to remove account provisioned for rejected inbound");
        }
    }
}

/// Parse and check an engine template; it must be a JSON object
pub fn parse_engine_template(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::InvalidConfig(format!("engine template is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(Error::InvalidConfig(
            "engine template must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::inbound::{ProtocolSettings, SocksSettings};

    fn socks() -> ProtocolSettings {
        ProtocolSettings::Socks(SocksSettings {
            auth: "noauth".to_string(),
            accounts: Vec::new(),
            udp: false,
            ip: None,
        })
    }

    fn setup_with(policy: ProvisioningPolicy) -> (Arc<Database>, InboundRegistry, User) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let admin = db.ensure_admin("admin", "admin").unwrap();
        let registry = InboundRegistry::new(db.clone(), policy);
        (db, registry, admin)
    }

    fn setup() -> (Arc<Database>, InboundRegistry, User) {
        setup_with(ProvisioningPolicy::default())
    }

    #[test]
    fn test_add_derives_tag_and_enables() {
        let (_db, registry, admin) = setup();

        let added = registry.add(&admin, NewInbound::new(8443, socks())).unwrap();
        assert!(added.inbound.id > 0);
        assert_eq!(added.inbound.tag, "inbound-8443");
        assert!(added.inbound.enable);
        assert_eq!(added.owner, OwnerResolution::Skipped);
        assert_eq!(added.inbound.user_id, admin.id);
    }

    #[test]
    fn test_add_keeps_explicit_tag() {
        let (_db, registry, admin) = setup();

        let added = registry
            .add(&admin, NewInbound::new(8443, socks()).with_tag("edge"))
            .unwrap();
        assert_eq!(added.inbound.tag, "edge");
    }

    #[test]
    fn test_add_rejects_enabled_port_conflict() {
        let (_db, registry, admin) = setup();

        let first = registry.add(&admin, NewInbound::new(443, socks())).unwrap();
        let err = registry.add(&admin, NewInbound::new(443, socks())).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        registry.delete(first.inbound.id).unwrap();
        registry.add(&admin, NewInbound::new(443, socks())).unwrap();
    }

    #[test]
    fn test_add_port_of_disabled_inbound_succeeds() {
        let (_db, registry, admin) = setup();

        let first = registry.add(&admin, NewInbound::new(443, socks())).unwrap();
        registry
            .update(
                first.inbound.id,
                InboundUpdate {
                    enable: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let second = registry
            .add(&admin, NewInbound::new(443, socks()).with_tag("second"))
            .unwrap();
        assert!(second.inbound.enable);
    }

    #[test]
    fn test_add_provisions_viewer_for_new_label() {
        let (db, registry, admin) = setup();

        let added = registry
            .add(&admin, NewInbound::new(1000, socks()).with_remark("alice"))
            .unwrap();

        let alice = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(alice.role, Role::Viewer);
        assert!(alice.password_matches("admin"));
        assert_eq!(added.owner, OwnerResolution::Provisioned { user_id: alice.id });
        assert_eq!(added.inbound.user_id, alice.id);
    }

    #[test]
    fn test_add_existing_label_owned_by_actor() {
        let (db, registry, admin) = setup();
        let bob = db
            .create_user(&NewUser {
                username: "bob".to_string(),
                password: "hunter2".to_string(),
                role: Role::Viewer,
            })
            .unwrap();

        let added = registry
            .add(&admin, NewInbound::new(1000, socks()).with_remark("bob"))
            .unwrap();

        assert_eq!(added.owner, OwnerResolution::ExistingAccount { user_id: bob.id });
        assert_eq!(added.inbound.user_id, admin.id);
        // No second account was created
        assert_eq!(db.get_user_by_username("bob").unwrap().unwrap().id, bob.id);
    }

    #[test]
    fn test_username_and_password_policy() {
        let policy = ProvisioningPolicy {
            owner_match: OwnerMatch::UsernameAndPassword,
            ..ProvisioningPolicy::default()
        };
        let (db, registry, admin) = setup_with(policy);

        // Still on the default credential: counts as a match
        let carol = db
            .create_user(&NewUser {
                username: "carol".to_string(),
                password: "admin".to_string(),
                role: Role::Viewer,
            })
            .unwrap();
        let added = registry
            .add(&admin, NewInbound::new(1000, socks()).with_remark("carol"))
            .unwrap();
        assert_eq!(added.owner, OwnerResolution::ExistingAccount { user_id: carol.id });

        // Changed password: not a match, provisioning collides with the username
        db.create_user(&NewUser {
            username: "dave".to_string(),
            password: "changed".to_string(),
            role: Role::Viewer,
        })
        .unwrap();
        let added = registry
            .add(&admin, NewInbound::new(1001, socks()).with_remark("dave"))
            .unwrap();
        assert!(matches!(added.owner, OwnerResolution::Failed { .. }));
        assert_eq!(added.inbound.user_id, admin.id);
    }

    #[test]
    fn test_provisioning_disabled() {
        let policy = ProvisioningPolicy {
            enabled: false,
            ..ProvisioningPolicy::default()
        };
        let (db, registry, admin) = setup_with(policy);

        let added = registry
            .add(&admin, NewInbound::new(1000, socks()).with_remark("erin"))
            .unwrap();
        assert_eq!(added.owner, OwnerResolution::Skipped);
        assert!(db.get_user_by_username("erin").unwrap().is_none());
    }

    #[test]
    fn test_rejected_add_discards_provisioned_account() {
        let (db, registry, admin) = setup();

        registry
            .add(&admin, NewInbound::new(2000, socks()).with_tag("shared"))
            .unwrap();

        // Port is free but the tag collides at the store
        let err = registry
            .add(
                &admin,
                NewInbound::new(2001, socks())
                    .with_remark("frank")
                    .with_tag("shared"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(db.get_user_by_username("frank").unwrap().is_none());
    }

    #[test]
    fn test_add_validates_settings() {
        let (_db, registry, admin) = setup();

        let bad = ProtocolSettings::Socks(SocksSettings {
            auth: "password".to_string(),
            accounts: Vec::new(),
            udp: false,
            ip: None,
        });
        let err = registry.add(&admin, NewInbound::new(1080, bad)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = registry.add(&admin, NewInbound::new(0, socks())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_update_missing_inbound() {
        let (_db, registry, _admin) = setup();
        let err = registry.update(42, InboundUpdate::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_update_port_rechecks_uniqueness() {
        let (_db, registry, admin) = setup();

        let a = registry.add(&admin, NewInbound::new(1000, socks())).unwrap();
        registry.add(&admin, NewInbound::new(2000, socks())).unwrap();

        // Keeping its own port is fine
        registry
            .update(
                a.inbound.id,
                InboundUpdate {
                    port: Some(1000),
                    remark: Some("same".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = registry
            .update(
                a.inbound.id,
                InboundUpdate {
                    port: Some(2000),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let updated = registry
            .update(
                a.inbound.id,
                InboundUpdate {
                    port: Some(3000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.tag, "inbound-3000");
        assert_eq!(registry.get(a.inbound.id).unwrap().port, 3000);
    }

    #[test]
    fn test_update_empty_tag_rederives() {
        let (_db, registry, admin) = setup();

        let a = registry
            .add(&admin, NewInbound::new(1000, socks()).with_tag("custom"))
            .unwrap();
        let updated = registry
            .update(
                a.inbound.id,
                InboundUpdate {
                    tag: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.tag, "inbound-1000");
    }

    #[test]
    fn test_delete_missing_inbound() {
        let (_db, registry, _admin) = setup();
        let err = registry.delete(7).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_list_filters_by_owner() {
        let (_db, registry, admin) = setup();

        registry.add(&admin, NewInbound::new(1000, socks())).unwrap();
        let alice = registry
            .add(&admin, NewInbound::new(2000, socks()).with_remark("alice"))
            .unwrap();
        registry.add(&admin, NewInbound::new(3000, socks())).unwrap();

        assert_eq!(registry.list(None).unwrap().len(), 3);
        let owned = registry.list(Some(alice.inbound.user_id)).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].port, 2000);
    }

    #[test]
    fn test_enabled_inbounds_skips_disabled() {
        let (_db, registry, admin) = setup();

        let a = registry.add(&admin, NewInbound::new(1000, socks())).unwrap();
        registry.add(&admin, NewInbound::new(2000, socks())).unwrap();
        registry
            .update(
                a.inbound.id,
                InboundUpdate {
                    enable: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let enabled = registry.enabled_inbounds().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].port, 2000);
    }

    #[test]
    fn test_engine_template_setting() {
        let (db, registry, _admin) = setup();

        assert!(registry.engine_template().unwrap().is_none());

        db.set_setting(ENGINE_TEMPLATE_KEY, r#"{"log":{"loglevel":"debug"}}"#)
            .unwrap();
        let template = registry.engine_template().unwrap().unwrap();
        assert_eq!(template["log"]["loglevel"], "debug");

        db.set_setting(ENGINE_TEMPLATE_KEY, "[1, 2]").unwrap();
        assert!(matches!(
            registry.engine_template().unwrap_err(),
            Error::InvalidConfig(_)
        ));
    }
}
