//! Execution units
//!
//! A [`FunctionExecutionUnit`] is one compilable body (a function or a loop
//! body) together with everything the tiering core keeps for it: the
//! scheduler, the inline cache sites, and the entry point registry. It is
//! owned by the runtime and only touched by the owning thread.

use std::fmt;
use std::sync::Arc;

use crate::config::JitConfig;
use crate::entry_point::EntryPointRegistry;
use crate::error::{Error, Result};
use crate::guard::GuardSession;
use crate::inline_cache::InlineCacheSite;
use crate::scheduler::TierScheduler;
use crate::shape::{FunctionId, PropertyId};
use crate::snapshot::{build_snapshot, SnapshotOptions, TypeSpecializationSnapshot};

/// What the byte-code layer tells the core about a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub function_id: FunctionId,
    /// Property accessed at each inline cache site, by site index
    pub cache_properties: Vec<PropertyId>,
}

impl FunctionDescriptor {
    pub fn new(function_id: FunctionId, cache_properties: Vec<PropertyId>) -> Self {
        Self { function_id, cache_properties }
    }

    pub fn inline_cache_count(&self) -> usize {
        self.cache_properties.len()
    }
}

/// Opaque byte code reference; the core never looks inside
#[derive(Clone)]
pub struct BytecodeHandle {
    bytes: Arc<[u8]>,
}

impl BytecodeHandle {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether both handles refer to the same byte code
    pub fn same_as(&self, other: &BytecodeHandle) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for BytecodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BytecodeHandle({} bytes)", self.bytes.len())
    }
}

/// Whether a unit is a whole function or one of its loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Function,
    LoopBody { parent: FunctionId, loop_number: u32 },
}

/// One compilable unit and its tiering state
#[derive(Debug)]
pub struct FunctionExecutionUnit {
    id: FunctionId,
    kind: UnitKind,
    bytecode: BytecodeHandle,
    scheduler: TierScheduler,
    sites: Vec<InlineCacheSite>,
    registry: EntryPointRegistry,
}

impl FunctionExecutionUnit {
    pub fn new(descriptor: &FunctionDescriptor, kind: UnitKind, bytecode: BytecodeHandle, config: &JitConfig) -> Self {
        let sites = descriptor
            .cache_properties
            .iter()
            .map(|&property| InlineCacheSite::new(property, config.polymorphic_cache_capacity))
            .collect();
        Self {
            id: descriptor.function_id,
            kind,
            bytecode,
            scheduler: TierScheduler::new(config),
            sites,
            registry: EntryPointRegistry::new(),
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn bytecode(&self) -> &BytecodeHandle {
        &self.bytecode
    }

    pub fn scheduler(&self) -> &TierScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TierScheduler {
        &mut self.scheduler
    }

    pub fn registry(&self) -> &EntryPointRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntryPointRegistry {
        &mut self.registry
    }

    pub fn sites(&self) -> &[InlineCacheSite] {
        &self.sites
    }

    pub fn site(&self, index: usize) -> Result<&InlineCacheSite> {
        self.sites
            .get(index)
            .ok_or(Error::InvalidCacheSite { function: self.id, site: index })
    }

    pub fn site_mut(&mut self, index: usize) -> Result<&mut InlineCacheSite> {
        let function = self.id;
        self.sites
            .get_mut(index)
            .ok_or(Error::InvalidCacheSite { function, site: index })
    }

    /// Snapshot every site that has something to specialize on, in site order
    pub fn build_snapshots(
        &mut self,
        options: &SnapshotOptions,
        session: &mut GuardSession<'_>,
    ) -> Vec<Arc<TypeSpecializationSnapshot>> {
        self.sites
            .iter_mut()
            .enumerate()
            .filter_map(|(index, site)| build_snapshot(index, site, options, session))
            .map(Arc::new)
            .collect()
    }

    /// Start over with new byte code: counters, caches, and entry points reset
    pub fn regenerate(&mut self, bytecode: BytecodeHandle) {
        self.bytecode = bytecode;
        self.scheduler.reinitialize();
        for site in &mut self.sites {
            site.clear();
        }
        self.registry.reset_to_interpreter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardManager;
    use crate::inline_cache::SlotInfo;
    use crate::shape::{ShapeTable, TypeId};

    fn unit(sites: usize) -> FunctionExecutionUnit {
        let descriptor = FunctionDescriptor::new(FunctionId(1), (0..sites as u32).map(PropertyId).collect());
        FunctionExecutionUnit::new(
            &descriptor,
            UnitKind::Function,
            BytecodeHandle::new(vec![0u8; 16]),
            &JitConfig::default(),
        )
    }

    #[test]
    fn test_sites_follow_descriptor() {
        let unit = unit(3);
        assert_eq!(unit.sites().len(), 3);
        assert_eq!(unit.site(2).unwrap().property(), PropertyId(2));
        assert!(matches!(
            unit.site(3),
            Err(Error::InvalidCacheSite { function: FunctionId(1), site: 3 })
        ));
    }

    #[test]
    fn test_build_snapshots_skips_empty_sites() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let shape = shapes.create(TypeId(1));
        let mut unit = unit(3);
        unit.site_mut(1).unwrap().record(&shape, SlotInfo::local(0));

        let mut session = manager.session();
        let snapshots = unit.build_snapshots(&SnapshotOptions::default(), &mut session);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].site(), 1);
    }

    #[test]
    fn test_regenerate_resets_state() {
        let shapes = ShapeTable::new();
        let shape = shapes.create(TypeId(1));
        let mut unit = unit(1);
        unit.site_mut(0).unwrap().record(&shape, SlotInfo::local(0));
        unit.scheduler_mut().record_interpreted_call();

        let fresh = BytecodeHandle::new(vec![1u8; 8]);
        unit.regenerate(fresh.clone());
        assert!(unit.bytecode().same_as(&fresh));
        assert!(unit.site(0).unwrap().is_empty());
        assert_eq!(unit.scheduler().interpreted_count(), 0);
    }

    #[test]
    fn test_loop_body_kind() {
        let descriptor = FunctionDescriptor::new(FunctionId(7), Vec::new());
        let unit = FunctionExecutionUnit::new(
            &descriptor,
            UnitKind::LoopBody { parent: FunctionId(1), loop_number: 0 },
            BytecodeHandle::new(Vec::new()),
            &JitConfig::default(),
        );
        assert_eq!(unit.kind(), UnitKind::LoopBody { parent: FunctionId(1), loop_number: 0 });
        assert_eq!(descriptor.inline_cache_count(), 0);
    }
}
