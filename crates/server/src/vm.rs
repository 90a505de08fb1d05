//! VM entity and registry, §3.1/§4.6.

/// A known guest VM.
#[derive(Debug, Clone)]
pub struct Vm {
    /// Negative means "not currently running".
    pub domid: i32,
    /// Canonical 36-character form; underscores arriving from callers are
    /// canonicalized to hyphens before storage.
    pub uuid: String,
}

/// Canonicalizes a uuid as received from callers: underscores become
/// hyphens. Mirrors the source's `uuid_copy_and_sanitize`.
pub fn sanitize_uuid(raw: &str) -> String {
    raw.replace('_', "-")
}

#[derive(Debug, Default)]
pub struct VmRegistry {
    vms: Vec<Vm>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, domid: i32) -> Option<&Vm> {
        self.vms.iter().find(|vm| vm.domid == domid)
    }

    pub fn lookup_mut(&mut self, domid: i32) -> Option<&mut Vm> {
        self.vms.iter_mut().find(|vm| vm.domid == domid)
    }

    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<&Vm> {
        let uuid = sanitize_uuid(uuid);
        self.vms.iter().find(|vm| vm.uuid == uuid)
    }

    /// If a VM with that uuid already exists, updates its `domid` (VM
    /// restart). If a VM with that `domid` already exists (and it isn't the
    /// same VM), this is an error.
    pub fn add(&mut self, domid: i32, uuid: &str) -> crate::error::Result<()> {
        let uuid = sanitize_uuid(uuid);

        if let Some(existing) = self.vms.iter_mut().find(|vm| vm.uuid == uuid) {
            existing.domid = domid;
            return Ok(());
        }

        if self.vms.iter().any(|vm| vm.domid == domid) {
            return Err(crate::error::DaemonError::Validation(format!(
                "domid {} already registered to a different vm",
                domid
            )));
        }

        self.vms.push(Vm { domid, uuid });
        Ok(())
    }

    pub fn remove(&mut self, domid: i32) -> crate::error::Result<Vm> {
        let idx = self
            .vms
            .iter()
            .position(|vm| vm.domid == domid)
            .ok_or_else(|| crate::error::DaemonError::NotFound(format!("vm {}", domid)))?;
        Ok(self.vms.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vm> {
        self.vms.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_underscores_with_hyphens() {
        assert_eq!(
            sanitize_uuid("aaaa_bbbb_cccc_dddd"),
            "aaaa-bbbb-cccc-dddd"
        );
    }

    #[test]
    fn add_with_existing_uuid_updates_domid_instead_of_erroring() {
        let mut reg = VmRegistry::new();
        reg.add(3, "aaaa-bbbb").unwrap();
        reg.add(5, "aaaa-bbbb").unwrap();
        assert_eq!(reg.lookup_by_uuid("aaaa-bbbb").unwrap().domid, 5);
        assert!(reg.lookup(3).is_none());
    }

    #[test]
    fn add_with_duplicate_domid_and_different_uuid_errors() {
        let mut reg = VmRegistry::new();
        reg.add(3, "aaaa-bbbb").unwrap();
        assert!(reg.add(3, "cccc-dddd").is_err());
    }

    #[test]
    fn remove_unknown_domid_errors() {
        let mut reg = VmRegistry::new();
        assert!(reg.remove(1).is_err());
    }
}
