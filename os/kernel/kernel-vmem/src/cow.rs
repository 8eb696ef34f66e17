//! # Copy-on-write fork
//!
//! The child receives the parent's frames, not copies. Every shared user
//! page that was writable (or already copy-on-write) becomes read-only and
//! copy-on-write in *both* spaces; the first write on either side faults
//! and gets a private copy.

use crate::{
    AddressSpace, FrameAlloc, MmArea, PageEntryBits, PhysMapper, PhysicalMemory, TranslationCache,
    VmError, invalidate_if_active,
};
use alloc::vec::Vec;
use log::{debug, warn};

/// Clone `parent` for a forked child, sharing every present user page of
/// `areas`.
///
/// The parent's downgraded entries are invalidated on this CPU when the
/// parent is the active space. Pages that are absent or kernel-only are
/// skipped.
///
/// # Errors
/// [`VmError::OutOfMemory`] if a frame for the child's tables cannot be
/// allocated. The partial child is destroyed; the parent keeps the
/// downgrades already applied, which is harmless since a copy-on-write
/// fault on a page nobody else shares just copies it.
pub fn copy_address_space<M, C>(
    parent: &mut AddressSpace,
    areas: &[MmArea],
    mem: &mut PhysicalMemory<M>,
    cache: &mut C,
) -> Result<AddressSpace, VmError>
where
    M: FrameAlloc + PhysMapper,
    C: TranslationCache + ?Sized,
{
    let Some(kernel) = parent.kernel_template() else {
        return Err(VmError::InvalidAddress(parent.user_end()));
    };
    let kernel = alloc::sync::Arc::clone(kernel);
    let mut child = AddressSpace::new_user(mem, &kernel)?;

    let mut shared = 0usize;
    for area in areas {
        let pages: Vec<_> = parent.user_pages_in(area.start, area.end).collect();
        for (va, entry) in pages {
            let shareable = entry.writable() || entry.copy_on_write();
            let flags = if shareable { entry.downgraded_to_cow() } else { entry };
            let result = if shareable {
                parent
                    .update(mem, va, PageEntryBits::downgraded_to_cow)
                    .map(|_| invalidate_if_active(cache, parent, va))
                    .and_then(|_| child.map(mem, va, entry.frame(), flags))
            } else {
                child.map(mem, va, entry.frame(), flags)
            };
            if let Err(e) = result {
                warn!("copyuvm: {e} after sharing {shared} pages, rolling back");
                child.destroy(mem);
                return Err(e);
            }
            shared += 1;
        }
    }

    debug!("copyuvm: child {} shares {shared} pages with {}", child.root(), parent.root());
    Ok(child)
}
