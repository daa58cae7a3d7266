use crate::{GmmuDriver, MmuError, MmuLevelTree};
use alloc::collections::BTreeMap;
use gmmu_addresses::{DeviceId, GpuVirtualAddress, MemHandle, PageSize, VaSpaceHandle};

/// Identity of one address-space view of one surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TreeKey {
    pub device: DeviceId,
    pub mem: MemHandle,
    pub virt_base: GpuVirtualAddress,
    pub vaspace: VaSpaceHandle,
}

/// Trees by [`TreeKey`], owned by the caller's context.
///
/// Trees are created on first use and live until their surface releases its
/// memory.
#[derive(Debug, Default)]
pub struct MmuLevelTreeRegistry {
    trees: BTreeMap<TreeKey, MmuLevelTree>,
}

impl MmuLevelTreeRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { trees: BTreeMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &TreeKey) -> Option<&MmuLevelTree> {
        self.trees.get(key)
    }

    pub fn get_mut(&mut self, key: &TreeKey) -> Option<&mut MmuLevelTree> {
        self.trees.get_mut(key)
    }

    /// The tree for `key`, created unexplored if missing.
    pub fn get_or_create(
        &mut self,
        driver: &dyn GmmuDriver,
        key: TreeKey,
        size: u64,
        seed: PageSize,
    ) -> &mut MmuLevelTree {
        self.trees.entry(key).or_insert_with(|| {
            log::debug!("new tree for {key:?}");
            MmuLevelTree::new(key, driver.mmu_format(), size, seed)
        })
    }

    /// The tree for `key`, explored.
    ///
    /// # Errors
    /// See [`MmuLevelTree::explore`].
    pub fn get_or_explore(
        &mut self,
        driver: &dyn GmmuDriver,
        key: TreeKey,
        size: u64,
        seed: PageSize,
        prefer_legacy: bool,
    ) -> Result<&mut MmuLevelTree, MmuError> {
        let tree = self.get_or_create(driver, key, size, seed);
        tree.explore(driver, prefer_legacy)?;
        Ok(tree)
    }

    /// Forget one tree.
    pub fn invalidate(&mut self, key: &TreeKey) -> Option<MmuLevelTree> {
        self.trees.remove(key)
    }

    /// Forget every tree of a memory allocation; returns how many were dropped.
    pub fn invalidate_mem(&mut self, device: DeviceId, mem: MemHandle) -> usize {
        let before = self.trees.len();
        self.trees.retain(|k, _| !(k.device == device && k.mem == mem));
        let dropped = before - self.trees.len();
        if dropped > 0 {
            log::debug!("dropped {dropped} trees of {mem:?}");
        }
        dropped
    }
}
