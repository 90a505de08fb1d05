//! The `SettingsStore` contract and the rule-list (de)serialization it
//! backs, §1/§4.8/§6.4.
//!
//! Per-flag `device/<flag>` keys double as both the required- and
//! forbidden-type masks: `"1"` marks the flag required, `"0"` marks it
//! forbidden, and an absent key means "don't care" about that flag. This is
//! how the settings tree's boolean-looking per-flag keys carry spec.md's
//! richer required/forbidden matcher pair without adding new top-level keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use usbmuxd_protocol::{DeviceTypeMask, RuleCommand};

use crate::error::{DaemonError, Result};
use crate::rule::Rule;

const ROOT: &str = "/usb-rules";

const TYPE_FLAGS: &[(&str, DeviceTypeMask)] = &[
    ("keyboard", DeviceTypeMask::KEYBOARD),
    ("mouse", DeviceTypeMask::MOUSE),
    ("game_controller", DeviceTypeMask::GAME_CONTROLLER),
    ("mass_storage", DeviceTypeMask::MASS_STORAGE),
    ("optical", DeviceTypeMask::OPTICAL),
    ("nic", DeviceTypeMask::NIC),
    ("bluetooth", DeviceTypeMask::BLUETOOTH),
    ("audio", DeviceTypeMask::AUDIO),
];

pub trait SettingsStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<String>>;
    async fn write(&self, path: &str, value: &str) -> Result<()>;
    /// Lists the immediate child key names under `path` (not full paths).
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;
    async fn remove_subtree(&self, path: &str) -> Result<()>;
}

/// Reads the whole `/usb-rules` subtree. Unknown subkeys are logged at
/// `warn` and skipped, per §6.4's leniency requirement.
pub async fn reload_from_store<S: SettingsStore>(store: &S) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for pos_str in store.list_children(ROOT).await? {
        let Ok(pos) = pos_str.parse::<u16>() else {
            tracing::warn!(key = %pos_str, "ignoring non-numeric rule key under /usb-rules");
            continue;
        };
        let base = format!("{ROOT}/{pos_str}");
        rules.push(read_rule(store, &base, pos).await?);
    }
    rules.sort_by_key(|r| r.pos);
    Ok(rules)
}

async fn read_rule<S: SettingsStore>(store: &S, base: &str, pos: u16) -> Result<Rule> {
    let command = store
        .read(&format!("{base}/command"))
        .await?
        .and_then(|s| RuleCommand::parse(&s))
        .unwrap_or(RuleCommand::Deny);

    let description = store
        .read(&format!("{base}/description"))
        .await?
        .unwrap_or_default();

    let mut required_type = DeviceTypeMask::NONE;
    let mut forbidden_type = DeviceTypeMask::NONE;
    for (flag, bit) in TYPE_FLAGS {
        match store.read(&format!("{base}/device/{flag}")).await? {
            Some(v) if v == "1" => required_type.insert(*bit),
            Some(v) if v == "0" => forbidden_type.insert(*bit),
            Some(other) => {
                tracing::warn!(flag, value = %other, "ignoring malformed type flag value");
            }
            None => {}
        }
    }

    let vendor_id = match store.read(&format!("{base}/device/vendor_id")).await? {
        Some(s) => Some(parse_hex4(&s, "vendor_id")?),
        None => None,
    };
    let product_id = match store.read(&format!("{base}/device/device_id")).await? {
        Some(s) => Some(parse_hex4(&s, "device_id")?),
        None => None,
    };
    let serial = store.read(&format!("{base}/device/serial")).await?;

    let mut sysattrs = Vec::new();
    for key in store
        .list_children(&format!("{base}/device/sysattr"))
        .await?
    {
        if let Some(value) = store
            .read(&format!("{base}/device/sysattr/{key}"))
            .await?
        {
            sysattrs.push((key, value));
        }
    }

    let mut properties = Vec::new();
    for key in store
        .list_children(&format!("{base}/device/property"))
        .await?
    {
        if let Some(value) = store
            .read(&format!("{base}/device/property/{key}"))
            .await?
        {
            properties.push((key, value));
        }
    }

    let vm_uuid = store.read(&format!("{base}/vm/uuid")).await?;

    Ok(Rule {
        pos,
        command,
        description,
        vendor_id,
        product_id,
        serial,
        required_type,
        forbidden_type,
        sysattrs,
        properties,
        vm_uuid,
    })
}

fn parse_hex4(s: &str, field: &str) -> Result<u16> {
    u16::from_str_radix(s, 16)
        .map_err(|_| DaemonError::Validation(format!("malformed hex in {field}: {s}")))
}

/// Removes the whole `/usb-rules` subtree then re-writes every rule, per
/// §6.4.
pub async fn persist<S: SettingsStore>(store: &S, rules: &[Rule]) -> Result<()> {
    store.remove_subtree(ROOT).await?;
    for rule in rules {
        write_rule(store, rule).await?;
    }
    Ok(())
}

async fn write_rule<S: SettingsStore>(store: &S, rule: &Rule) -> Result<()> {
    let base = format!("{ROOT}/{}", rule.pos);
    store
        .write(&format!("{base}/command"), rule.command.as_str())
        .await?;
    store
        .write(&format!("{base}/description"), &rule.description)
        .await?;

    for (flag, bit) in TYPE_FLAGS {
        if rule.required_type.contains(*bit) {
            store.write(&format!("{base}/device/{flag}"), "1").await?;
        } else if rule.forbidden_type.contains(*bit) {
            store.write(&format!("{base}/device/{flag}"), "0").await?;
        }
    }

    if let Some(vendor) = rule.vendor_id {
        store
            .write(&format!("{base}/device/vendor_id"), &format!("{vendor:04X}"))
            .await?;
    }
    if let Some(product) = rule.product_id {
        store
            .write(
                &format!("{base}/device/device_id"),
                &format!("{product:04X}"),
            )
            .await?;
    }
    if let Some(serial) = &rule.serial {
        store
            .write(&format!("{base}/device/serial"), serial)
            .await?;
    }
    for (key, value) in &rule.sysattrs {
        store
            .write(&format!("{base}/device/sysattr/{key}"), value)
            .await?;
    }
    for (key, value) in &rule.properties {
        store
            .write(&format!("{base}/device/property/{key}"), value)
            .await?;
    }
    if let Some(uuid) = &rule.vm_uuid {
        store.write(&format!("{base}/vm/uuid"), uuid).await?;
    }
    Ok(())
}

/// A [`SettingsStore`] backed by a single TOML file holding the flattened
/// `/usb-rules/...` tree as a string-to-string table. No real hypervisor
/// toolstack settings daemon is part of the dependency stack (§1 treats
/// `SettingsStore` as contract-only), so this plays the same role for the
/// settings tree that `DaemonConfig::save`/`load` plays for daemon config:
/// the whole tree is read into memory once at startup and rewritten to disk
/// on every mutation.
pub struct FileSettingsStore {
    path: PathBuf,
    tree: tokio::sync::Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let tree = match tokio::fs::read_to_string(&path).await {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                DaemonError::FatalBootstrap(format!(
                    "malformed settings store file {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(DaemonError::FatalBootstrap(format!(
                    "failed to read settings store file {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path,
            tree: tokio::sync::Mutex::new(tree),
        })
    }

    async fn flush(&self, tree: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DaemonError::TransientExternal(format!(
                    "failed to create settings store directory: {e}"
                ))
            })?;
        }
        let content = toml::to_string_pretty(tree).map_err(|e| {
            DaemonError::TransientExternal(format!("failed to serialize settings store: {e}"))
        })?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| DaemonError::TransientExternal(format!("failed to write settings store file: {e}")))
    }
}

impl SettingsStore for FileSettingsStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.tree.lock().await.get(path).cloned())
    }

    async fn write(&self, path: &str, value: &str) -> Result<()> {
        let mut tree = self.tree.lock().await;
        tree.insert(path.to_string(), value.to_string());
        self.flush(&tree).await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{path}/");
        let tree = self.tree.lock().await;
        let mut names: Vec<String> = tree
            .keys()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .map(|rest| rest.split('/').next().unwrap().to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn remove_subtree(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let prefix = format!("{path}/");
        tree.retain(|k, _| !k.starts_with(&prefix));
        self.flush(&tree).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemorySettingsStore {
        tree: Mutex<BTreeMap<String, String>>,
    }

    impl SettingsStore for InMemorySettingsStore {
        async fn read(&self, path: &str) -> Result<Option<String>> {
            Ok(self.tree.lock().unwrap().get(path).cloned())
        }

        async fn write(&self, path: &str, value: &str) -> Result<()> {
            self.tree
                .lock()
                .unwrap()
                .insert(path.to_string(), value.to_string());
            Ok(())
        }

        async fn list_children(&self, path: &str) -> Result<Vec<String>> {
            let prefix = format!("{path}/");
            let tree = self.tree.lock().unwrap();
            let mut names: Vec<String> = tree
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .map(|rest| rest.split('/').next().unwrap().to_string())
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        }

        async fn remove_subtree(&self, path: &str) -> Result<()> {
            let mut tree = self.tree.lock().unwrap();
            let prefix = format!("{path}/");
            tree.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        }
    }

    fn sample_rule() -> Rule {
        Rule {
            pos: 10,
            command: RuleCommand::Always,
            description: "Keyboard for U".into(),
            vendor_id: Some(0x046d),
            product_id: Some(0xc534),
            serial: Some("S1".into()),
            required_type: DeviceTypeMask::KEYBOARD,
            forbidden_type: DeviceTypeMask::OPTICAL,
            sysattrs: vec![("manufacturer".into(), "Logitech".into())],
            properties: vec![("ID_BUS".into(), "usb".into())],
            vm_uuid: Some("aaaa-bbbb".into()),
        }
    }

    #[tokio::test]
    async fn round_trips_a_full_rule() {
        let store = InMemorySettingsStore::default();
        persist(&store, &[sample_rule()]).await.unwrap();

        let rules = reload_from_store(&store).await.unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.pos, 10);
        assert_eq!(rule.command, RuleCommand::Always);
        assert_eq!(rule.vendor_id, Some(0x046d));
        assert_eq!(rule.product_id, Some(0xc534));
        assert_eq!(rule.serial.as_deref(), Some("S1"));
        assert!(rule.required_type.contains(DeviceTypeMask::KEYBOARD));
        assert!(rule.forbidden_type.contains(DeviceTypeMask::OPTICAL));
        assert_eq!(rule.sysattrs, vec![("manufacturer".into(), "Logitech".into())]);
        assert_eq!(rule.properties, vec![("ID_BUS".into(), "usb".into())]);
        assert_eq!(rule.vm_uuid.as_deref(), Some("aaaa-bbbb"));
    }

    #[tokio::test]
    async fn persist_clears_previous_rules_before_rewriting() {
        let store = InMemorySettingsStore::default();
        let mut first = sample_rule();
        first.pos = 5;
        persist(&store, &[first]).await.unwrap();

        let second = sample_rule();
        persist(&store, &[second]).await.unwrap();

        let rules = reload_from_store(&store).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pos, 10);
    }

    #[tokio::test]
    async fn file_settings_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");

        let store = FileSettingsStore::open(path.clone()).await.unwrap();
        persist(&store, &[sample_rule()]).await.unwrap();

        let reopened = FileSettingsStore::open(path).await.unwrap();
        let rules = reload_from_store(&reopened).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].vendor_id, Some(0x046d));
    }

    #[tokio::test]
    async fn file_settings_store_starts_empty_when_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");

        let store = FileSettingsStore::open(path).await.unwrap();
        let rules = reload_from_store(&store).await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn unknown_subkey_is_skipped_leniently() {
        let store = InMemorySettingsStore::default();
        store.write("/usb-rules/1/command", "allow").await.unwrap();
        store
            .write("/usb-rules/1/device/keyboard", "maybe")
            .await
            .unwrap();

        let rules = reload_from_store(&store).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].required_type.is_empty());
        assert!(rules[0].forbidden_type.is_empty());
    }
}
