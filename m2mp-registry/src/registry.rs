//! Device registry.
//!
//! [`DeviceRegistry`] is what sessions talk to. [`MemoryRegistry`] keeps
//! everything in memory and can mirror it to a JSON snapshot file.

use crate::device::{Device, DeviceHandle};
use crate::error::RegistryError;
use crate::ident::{device_id_for, is_valid_ident};
use crate::router::ChannelRule;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Domain new devices are placed in.
pub const DEFAULT_DOMAIN: &str = "default";

/// Device data access used by sessions. Implementations must be safe for
/// concurrent use from many sessions.
pub trait DeviceRegistry: Send + Sync {
    /// Looks up a device by identifier, creating it on first sight.
    fn device_by_ident_or_create(&self, ident: &str) -> Result<DeviceHandle, RegistryError>;

    fn device_by_ident(&self, ident: &str) -> Result<Option<DeviceHandle>, RegistryError>;

    fn settings(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError>;

    fn setting(&self, device: &Uuid, name: &str) -> Result<Option<String>, RegistryError>;

    fn settings_to_send(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError>;

    /// Commits a value and marks it as pending for the device.
    fn set_setting(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError>;

    /// Commits a value reported by the device, clearing the pending entry
    /// when it matches.
    fn ack_setting(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError>;

    fn delete_setting(&self, device: &Uuid, name: &str) -> Result<(), RegistryError>;

    fn status(&self, device: &Uuid, name: &str) -> Result<Option<String>, RegistryError>;

    fn set_status(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError>;

    /// Queued commands by command id.
    fn commands(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError>;

    /// Queues a command and returns its id.
    fn add_command(&self, device: &Uuid, command: &str) -> Result<String, RegistryError>;

    fn ack_command(
        &self,
        device: &Uuid,
        command_id: &str,
        response: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Channel rules of a device, or of the default device for `None`.
    fn channel_rules(&self, device: Option<&Uuid>) -> Result<Vec<ChannelRule>, RegistryError>;

    fn add_channel_rule(
        &self,
        device: Option<&Uuid>,
        rule: ChannelRule,
    ) -> Result<(), RegistryError>;

    /// Changes every time a channel rule is added.
    fn rules_generation(&self) -> u64;

    /// Firmware file content by name.
    fn firmware(&self, name: &str) -> Result<Option<Bytes>, RegistryError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    devices: Vec<Device>,
    default_rules: Vec<ChannelRule>,
}

#[derive(Default)]
struct State {
    devices: HashMap<Uuid, Device>,
    by_ident: HashMap<String, Uuid>,
    default_rules: Vec<ChannelRule>,
    firmware: HashMap<String, Bytes>,
}

/// In-memory registry with optional JSON persistence.
pub struct MemoryRegistry {
    state: RwLock<State>,
    generation: AtomicU64,
    persist_path: Option<PathBuf>,
    /// Serializes snapshot writers so they never share the tmp file.
    persist_lock: Mutex<()>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            generation: AtomicU64::new(0),
            persist_path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Creates a registry backed by a snapshot file, loading it if present.
    /// Every change is written back to the file.
    pub fn with_persistence(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let mut registry = Self::new();

        if path.exists() {
            let file = File::open(&path)?;
            let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
            let mut state = registry.state.write();
            for device in snapshot.devices {
                state.by_ident.insert(device.ident.clone(), device.id);
                state.devices.insert(device.id, device);
            }
            state.default_rules = snapshot.default_rules;
            tracing::info!(
                "Loaded {} devices from {}",
                state.devices.len(),
                path.display()
            );
        }

        registry.persist_path = Some(path);
        Ok(registry)
    }

    /// Writes the snapshot file, if any.
    pub fn persist(&self) -> Result<(), RegistryError> {
        if let Some(path) = &self.persist_path {
            // taken before the snapshot so a newer state is never overwritten
            let _guard = self.persist_lock.lock();
            let snapshot = {
                let state = self.state.read();
                Snapshot {
                    devices: state.devices.values().cloned().collect(),
                    default_rules: state.default_rules.clone(),
                }
            };
            let tmp = path.with_extension("tmp");
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
        }
        Ok(())
    }

    /// Makes a firmware file available for download.
    pub fn put_firmware(&self, name: impl Into<String>, content: impl Into<Bytes>) {
        self.state.write().firmware.insert(name.into(), content.into());
    }

    /// Loads every regular file of `dir` as a firmware file.
    pub fn load_firmware_dir(&self, dir: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            self.put_firmware(name, fs::read(entry.path())?);
            count += 1;
        }
        Ok(count)
    }

    /// Returns a full copy of a device record.
    pub fn device(&self, id: &Uuid) -> Option<Device> {
        self.state.read().devices.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    fn read<T>(&self, id: &Uuid, f: impl FnOnce(&Device) -> T) -> Result<T, RegistryError> {
        let state = self.state.read();
        let device = state
            .devices
            .get(id)
            .ok_or(RegistryError::DeviceNotFound(*id))?;
        Ok(f(device))
    }

    fn update<T>(&self, id: &Uuid, f: impl FnOnce(&mut Device) -> T) -> Result<T, RegistryError> {
        let result = {
            let mut state = self.state.write();
            let device = state
                .devices
                .get_mut(id)
                .ok_or(RegistryError::DeviceNotFound(*id))?;
            f(device)
        };
        self.persist()?;
        Ok(result)
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn device_by_ident_or_create(&self, ident: &str) -> Result<DeviceHandle, RegistryError> {
        if let Some(handle) = self.device_by_ident(ident)? {
            return Ok(handle);
        }
        if !is_valid_ident(ident) {
            return Err(RegistryError::InvalidIdent(ident.to_string()));
        }

        let handle = {
            let mut state = self.state.write();
            let id = device_id_for(ident);
            let device = state
                .devices
                .entry(id)
                .or_insert_with(|| Device::new(id, ident, DEFAULT_DOMAIN));
            let handle = device.handle();
            state.by_ident.insert(ident.to_string(), id);
            handle
        };
        tracing::info!("Created device {} for {}", handle.id, ident);
        self.persist()?;
        Ok(handle)
    }

    fn device_by_ident(&self, ident: &str) -> Result<Option<DeviceHandle>, RegistryError> {
        let state = self.state.read();
        Ok(state
            .by_ident
            .get(ident)
            .and_then(|id| state.devices.get(id))
            .map(Device::handle))
    }

    fn settings(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError> {
        self.read(device, |d| d.settings.clone())
    }

    fn setting(&self, device: &Uuid, name: &str) -> Result<Option<String>, RegistryError> {
        self.read(device, |d| d.settings.get(name).cloned())
    }

    fn settings_to_send(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError> {
        self.read(device, |d| d.settings_to_send.clone())
    }

    fn set_setting(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError> {
        self.update(device, |d| d.set_setting(name, value))
    }

    fn ack_setting(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError> {
        let now = chrono::Utc::now().timestamp();
        self.update(device, |d| d.ack_setting(name, value, now))
    }

    fn delete_setting(&self, device: &Uuid, name: &str) -> Result<(), RegistryError> {
        self.update(device, |d| d.delete_setting(name))
    }

    fn status(&self, device: &Uuid, name: &str) -> Result<Option<String>, RegistryError> {
        self.read(device, |d| d.status.get(name).cloned())
    }

    fn set_status(&self, device: &Uuid, name: &str, value: &str) -> Result<(), RegistryError> {
        self.update(device, |d| {
            d.status.insert(name.to_string(), value.to_string());
        })
    }

    fn commands(&self, device: &Uuid) -> Result<BTreeMap<String, String>, RegistryError> {
        self.read(device, |d| d.commands.clone())
    }

    fn add_command(&self, device: &Uuid, command: &str) -> Result<String, RegistryError> {
        let id = Uuid::new_v4().to_string();
        self.update(device, |d| {
            d.commands.insert(id.clone(), command.to_string());
        })?;
        Ok(id)
    }

    fn ack_command(
        &self,
        device: &Uuid,
        command_id: &str,
        response: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.update(device, |d| d.ack_command(command_id, response))
    }

    fn channel_rules(&self, device: Option<&Uuid>) -> Result<Vec<ChannelRule>, RegistryError> {
        match device {
            Some(id) => self.read(id, |d| d.channel_rules.clone()),
            None => Ok(self.state.read().default_rules.clone()),
        }
    }

    fn add_channel_rule(
        &self,
        device: Option<&Uuid>,
        rule: ChannelRule,
    ) -> Result<(), RegistryError> {
        rule.validate()?;
        let add = |rules: &mut Vec<ChannelRule>| {
            rules.retain(|r| !(r.priority == rule.priority && r.pattern == rule.pattern));
            rules.push(rule.clone());
        };
        match device {
            Some(id) => self.update(id, |d| add(&mut d.channel_rules))?,
            None => {
                add(&mut self.state.write().default_rules);
                self.persist()?;
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rules_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn firmware(&self, name: &str) -> Result<Option<Bytes>, RegistryError> {
        Ok(self.state.read().firmware.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lookup_or_create_is_idempotent() {
        let registry = MemoryRegistry::new();
        let a = registry.device_by_ident_or_create("imei:0123456789").unwrap();
        let b = registry.device_by_ident_or_create("imei:0123456789").unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.device(&a.id).unwrap().domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn test_invalid_ident_rejected() {
        let registry = MemoryRegistry::new();
        assert!(matches!(
            registry.device_by_ident_or_create("nope"),
            Err(RegistryError::InvalidIdent(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_device() {
        let registry = MemoryRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.settings(&id),
            Err(RegistryError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_settings_flow() {
        let registry = MemoryRegistry::new();
        let dev = registry.device_by_ident_or_create("imei:0123456789").unwrap();

        registry.set_setting(&dev.id, "apn", "internet").unwrap();
        assert_eq!(registry.settings_to_send(&dev.id).unwrap().len(), 1);

        registry.ack_setting(&dev.id, "apn", "internet").unwrap();
        assert!(registry.settings_to_send(&dev.id).unwrap().is_empty());
        assert_eq!(
            registry.setting(&dev.id, "apn").unwrap().as_deref(),
            Some("internet")
        );
    }

    #[test]
    fn test_commands_flow() {
        let registry = MemoryRegistry::new();
        let dev = registry.device_by_ident_or_create("imei:0123456789").unwrap();

        let id = registry.add_command(&dev.id, "reboot").unwrap();
        assert_eq!(registry.commands(&dev.id).unwrap().get(&id).unwrap(), "reboot");

        registry.ack_command(&dev.id, &id, None).unwrap();
        assert!(registry.commands(&dev.id).unwrap().is_empty());
    }

    #[test]
    fn test_rules_bump_generation() {
        let registry = MemoryRegistry::new();
        let before = registry.rules_generation();
        registry
            .add_channel_rule(None, ChannelRule::new(1, ".*", "converter-m2mp").unwrap())
            .unwrap();
        assert_eq!(registry.rules_generation(), before + 1);
        assert_eq!(registry.channel_rules(None).unwrap().len(), 1);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let id = {
            let registry = MemoryRegistry::with_persistence(&path).unwrap();
            let dev = registry.device_by_ident_or_create("imei:0123456789").unwrap();
            registry.set_setting(&dev.id, "apn", "internet").unwrap();
            registry.set_status(&dev.id, "cap", "gps").unwrap();
            dev.id
        };

        let registry = MemoryRegistry::with_persistence(&path).unwrap();
        let dev = registry.device_by_ident("imei:0123456789").unwrap().unwrap();
        assert_eq!(dev.id, id);
        assert_eq!(
            registry.status(&id, "cap").unwrap().as_deref(),
            Some("gps")
        );
        assert_eq!(registry.settings_to_send(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_updates_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = MemoryRegistry::with_persistence(&path).unwrap();
        let dev = registry.device_by_ident_or_create("imei:0123456789").unwrap();

        let errors = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for t in 0..8 {
                let registry = &registry;
                let errors = &errors;
                let id = dev.id;
                scope.spawn(move || {
                    for i in 0..200 {
                        if registry
                            .set_status(&id, &format!("k{}", t), &i.to_string())
                            .is_err()
                        {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(errors.load(Ordering::Relaxed), 0);

        // the last writer saw every thread's final value
        let reloaded = MemoryRegistry::with_persistence(&path).unwrap();
        for t in 0..8 {
            assert_eq!(
                reloaded.status(&dev.id, &format!("k{}", t)).unwrap().as_deref(),
                Some("199")
            );
        }
    }

    #[test]
    fn test_persist_leaves_complete_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = MemoryRegistry::with_persistence(&path).unwrap();
        registry.device_by_ident_or_create("imei:0123456789").unwrap();
        registry.persist().unwrap();

        assert!(!path.with_extension("tmp").exists());
        let raw = fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["devices"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_firmware_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("fw-1.bin"), b"\x01\x02\x03").unwrap();

        let registry = MemoryRegistry::new();
        assert_eq!(registry.load_firmware_dir(dir.path()).unwrap(), 1);
        assert_eq!(
            registry.firmware("fw-1.bin").unwrap().unwrap().as_ref(),
            b"\x01\x02\x03"
        );
        assert!(registry.firmware("missing").unwrap().is_none());
    }
}
