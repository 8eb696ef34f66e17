use crate::AddressSpace;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// A CPU's translation lookaside buffer, as far as this kernel cares.
///
/// Invalidation is local only. An address space runs on one CPU at a time,
/// so no other CPU can hold a stale translation for it.
pub trait TranslationCache {
    /// Directory frame currently loaded into CR3, if any.
    fn active_root(&self) -> Option<PhysicalFrame>;

    /// Load `root` into CR3, flushing all non-global translations.
    fn activate(&mut self, root: PhysicalFrame);

    /// Drop the cached translation of the page containing `va`.
    fn invalidate_page(&mut self, va: VirtualAddress);
}

/// Invalidate `va` on this CPU if `space` is the active address space.
///
/// Returns whether an invalidation was issued.
pub fn invalidate_if_active<C: TranslationCache + ?Sized>(
    cache: &mut C,
    space: &AddressSpace,
    va: VirtualAddress,
) -> bool {
    if cache.active_root() == Some(space.root()) {
        cache.invalidate_page(va);
        true
    } else {
        false
    }
}
