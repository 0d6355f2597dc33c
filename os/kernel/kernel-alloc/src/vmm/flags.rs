use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{EntryFlags, Level, PageEntry, SoftBits};
use utils_accessors_derive::Setters;

/// How a range is mapped.
///
/// ```
/// use kernel_alloc::vmm::MapFlags;
///
/// let stack = MapFlags::USER_DATA.with_allocate(true);
/// assert!(stack.writable && stack.user && !stack.executable);
/// ```
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct MapFlags {
    pub writable: bool,
    /// Accessible from CPL 3; also selects the user half when no hint is given.
    pub user: bool,
    pub executable: bool,
    /// Back every page with a zeroed frame now instead of on first touch.
    /// Ignored for mappings of a caller-supplied physical range.
    pub allocate: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Survives address-space switches; never applied to user pages.
    pub global: bool,
}

impl MapFlags {
    pub const KERNEL_DATA: Self = Self::NONE.with_writable(true);
    pub const USER_DATA: Self = Self::NONE.with_writable(true).with_user(true);
    pub const USER_CODE: Self = Self::NONE.with_user(true).with_executable(true);
    /// Device registers: uncached, never executable.
    pub const MMIO: Self = Self::NONE.with_writable(true).with_cache_disable(true);

    const NONE: Self = Self {
        writable: false,
        user: false,
        executable: false,
        allocate: false,
        write_through: false,
        cache_disable: false,
        global: false,
    };

    /// Present leaf bits for a committed page.
    pub(crate) const fn committed(self) -> EntryFlags {
        EntryFlags::table(self.user)
            .with_writable(self.writable)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_global(self.global && !self.user)
            .with_no_execute(!self.executable)
    }

    /// Not-present leaf remembering the permissions of a lazily backed page.
    pub(crate) const fn reserved(self) -> EntryFlags {
        PageEntry::reserved(self.writable, self.user, !self.executable).flags()
    }

    /// Not-present guard leaf; `user` only steers the links above it.
    pub(crate) const fn guard(self) -> EntryFlags {
        PageEntry::guard().flags().with_user(self.user)
    }

    /// Flags equivalent to an existing leaf, for moving it elsewhere.
    pub(crate) const fn of_entry(entry: PageEntry) -> Self {
        Self {
            writable: entry.writable(),
            user: entry.user(),
            executable: !entry.no_execute(),
            allocate: false,
            write_through: entry.write_through(),
            cache_disable: entry.cache_disable(),
            global: entry.global(),
        }
    }
}

/// What one virtual page of a context currently is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageStatus {
    Unmapped,
    /// Reserved, backed on first access.
    Reserved,
    Guard,
    Committed {
        /// Frame backing the page (the page itself, not the huge leaf base).
        frame: PhysicalAddress,
        /// [`Level::Pt`] for 4 KiB pages, higher for huge leaves such as the physical window.
        level: Level,
        writable: bool,
        user: bool,
        executable: bool,
        /// The frame belongs to whoever supplied it, not to the frame allocator.
        borrowed: bool,
    },
}

impl PageStatus {
    pub(crate) fn committed(entry: PageEntry, level: Level, frame: PhysicalAddress) -> Self {
        Self::Committed {
            frame,
            level,
            writable: entry.writable(),
            user: entry.user(),
            executable: !entry.no_execute(),
            borrowed: entry.soft().borrowed(),
        }
    }

    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// AVL bits of a present entry created from a caller-supplied frame.
pub(crate) const BORROWED: SoftBits = SoftBits::BORROWED;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pages_are_never_global() {
        let flags = MapFlags::USER_DATA.with_global(true).committed();
        assert!(flags.present && flags.user && flags.writable && !flags.global);
        assert!(MapFlags::KERNEL_DATA.with_global(true).committed().global);
    }

    #[test]
    fn reserved_keeps_permissions_but_is_not_present() {
        let flags = MapFlags::USER_CODE.reserved();
        assert!(!flags.present && flags.user && !flags.writable && !flags.no_execute);
        assert!(flags.soft.unused());
    }

    #[test]
    fn flags_survive_a_move() {
        let entry = MapFlags::MMIO.committed().with_soft(BORROWED);
        let packed = PageEntry::new()
            .with_present(entry.present)
            .with_writable(entry.writable)
            .with_cache_disable(entry.cache_disable)
            .with_no_execute(entry.no_execute)
            .with_soft(entry.soft);
        assert_eq!(MapFlags::of_entry(packed), MapFlags::MMIO);
    }
}
