//! # Shared File Views
//!
//! Process-wide table of shared file mappings.
//!
//! Some Unix kernels refuse a second `MAP_SHARED` mapping of an overlapping
//! region of the same file in one process and fail it with `ENOMEM`. When
//! that happens the table looks for an existing shared view of the same
//! `(device, inode)` whose range fully contains the request and hands out an
//! alias into it instead, bumping its reference count and raising its page
//! protection to cover both requests. Copy-on-write views are never aliased.
//!
//! The table is guarded by a single mutex. No other lock is taken while it is
//! held and the backend calls (`mmap`, `munmap`, `mprotect`) made under it
//! never call back into the table.

use std::sync::Mutex;

use crate::error::{ShimError, ShimResult};

/// Page protection of a view; combinable with `|`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(pub i32);

impl Protection
{
    pub const NONE: Self = Protection(0);
    pub const READ: Self = Protection(1);
    pub const WRITE: Self = Protection(2);
    pub const EXECUTE: Self = Protection(4);

    /// Whether every bit of `other` is present
    pub const fn covers(self, other: Protection) -> bool
    {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Protection
{
    type Output = Protection;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        Protection(self.0 | rhs.0)
    }
}

/// `(device, inode)` of the file backing a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey
{
    pub device: u64,
    pub inode: u64,
}

/// Sharing mode of a requested view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing
{
    Shared,
    CopyOnWrite,
}

/// Raw mapping primitives
///
/// Errors are raw `errno` values so the table can recognise `ENOMEM`.
pub trait MapBackend: Send + Sync
{
    /// Map `size` bytes of `fd` at `offset`, returning the local address
    ///
    /// ## Errors
    ///
    /// The `errno` of the failed mapping.
    fn map(&self, fd: i32, offset: u64, size: usize, protection: Protection, sharing: Sharing) -> Result<usize, i32>;

    /// ## Errors
    ///
    /// The `errno` of the failed unmap.
    fn unmap(&self, address: usize, size: usize) -> Result<(), i32>;

    /// ## Errors
    ///
    /// The `errno` of the failed protection change.
    fn protect(&self, address: usize, size: usize, protection: Protection) -> Result<(), i32>;
}

#[derive(Debug)]
struct ViewEntry
{
    key: FileKey,
    offset: u64,
    size: usize,
    address: usize,
    protection: Protection,
    refcount: usize,
}

impl ViewEntry
{
    fn contains(&self, offset: u64, size: usize) -> bool
    {
        let Some(end) = offset.checked_add(size as u64) else {
            return false;
        };
        offset >= self.offset && end <= self.offset + self.size as u64
    }

    fn overlaps(&self, offset: u64, size: usize) -> bool
    {
        let end = offset.saturating_add(size as u64);
        offset < self.offset + self.size as u64 && self.offset < end
    }

    fn holds(&self, address: usize) -> bool
    {
        address >= self.address && address < self.address + self.size
    }
}

/// A mapped view handed out by a [`ViewTable`]
///
/// Must be returned through [`ViewTable::unmap_view`]; dropping it leaks
/// the mapping.
#[derive(Debug, PartialEq, Eq)]
pub struct MappedView
{
    address: usize,
    size: usize,
    key: FileKey,
    sharing: Sharing,
}

impl MappedView
{
    /// Local address of the first requested byte
    pub fn address(&self) -> usize
    {
        self.address
    }

    pub fn len(&self) -> usize
    {
        self.size
    }

    pub fn is_empty(&self) -> bool
    {
        self.size == 0
    }
}

/// The alias-aware table of shared views
pub struct ViewTable<B>
{
    backend: B,
    views: Mutex<Vec<ViewEntry>>,
}

impl<B: MapBackend> ViewTable<B>
{
    pub fn new(backend: B) -> Self
    {
        ViewTable { backend, views: Mutex::new(Vec::new()) }
    }

    /// Map a view of a file, aliasing an existing shared view on `ENOMEM`
    ///
    /// ## Errors
    ///
    /// - `NotEnoughMemory`: the kernel refused the mapping and no registered
    ///   view contains the requested range
    /// - `Os`: any other mapping failure
    pub fn map_view(
        &self,
        fd: i32,
        key: FileKey,
        offset: u64,
        size: usize,
        protection: Protection,
        sharing: Sharing,
    ) -> ShimResult<MappedView>
    {
        let mut views = self.views.lock().map_err(|_| ShimError::Failed("view table poisoned".to_string()))?;

        match self.backend.map(fd, offset, size, protection, sharing) {
            Ok(address) => {
                if sharing == Sharing::Shared {
                    views.push(ViewEntry { key, offset, size, address, protection, refcount: 1 });
                }
                tracing::trace!(address, size, offset, "mapped file view");
                Ok(MappedView { address, size, key, sharing })
            }
            Err(code) if code == libc::ENOMEM && sharing == Sharing::Shared => {
                let Some(entry) = views.iter_mut().find(|entry| entry.key == key && entry.contains(offset, size))
                else {
                    let overlapping = views.iter().any(|entry| entry.key == key && entry.overlaps(offset, size));
                    tracing::debug!(offset, size, overlapping, "shared mapping refused and no view to alias");
                    return Err(ShimError::NotEnoughMemory);
                };

                if !entry.protection.covers(protection) {
                    let raised = entry.protection | protection;
                    self.backend
                        .protect(entry.address, entry.size, raised)
                        .map_err(|code| ShimError::Os { api: "mprotect", code })?;
                    entry.protection = raised;
                }
                entry.refcount += 1;

                #[allow(clippy::cast_possible_truncation)]
                let address = entry.address + (offset - entry.offset) as usize;
                tracing::debug!(address, size, refcount = entry.refcount, "aliased existing shared view");
                Ok(MappedView { address, size, key, sharing })
            }
            Err(code) => Err(ShimError::Os { api: "mmap", code }),
        }
    }

    /// Release a view; the mapping goes away when its last alias does
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the view isn't registered, `Os` if `munmap` fails.
    pub fn unmap_view(&self, view: MappedView) -> ShimResult<()>
    {
        if view.sharing == Sharing::CopyOnWrite {
            return self
                .backend
                .unmap(view.address, view.size)
                .map_err(|code| ShimError::Os { api: "munmap", code });
        }

        let mut views = self.views.lock().map_err(|_| ShimError::Failed("view table poisoned".to_string()))?;
        let index = views
            .iter()
            .position(|entry| entry.key == view.key && entry.holds(view.address))
            .ok_or_else(|| ShimError::InvalidArgument(format!("no shared view at {:#x}", view.address)))?;

        views[index].refcount -= 1;
        if views[index].refcount == 0 {
            let entry = views.remove(index);
            self.backend
                .unmap(entry.address, entry.size)
                .map_err(|code| ShimError::Os { api: "munmap", code })?;
            tracing::trace!(address = entry.address, "unmapped shared view");
        }
        Ok(())
    }

    /// Number of distinct shared mappings currently registered
    pub fn view_count(&self) -> usize
    {
        self.views.lock().map(|views| views.len()).unwrap_or(0)
    }

    /// Reference count of the registered view containing `address`
    pub fn refcount_at(&self, address: usize) -> Option<usize>
    {
        let views = self.views.lock().ok()?;
        views.iter().find(|entry| entry.holds(address)).map(|entry| entry.refcount)
    }
}

/// `mmap`-backed primitives
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMapper;

#[cfg(unix)]
impl MapBackend for SystemMapper
{
    fn map(&self, fd: i32, offset: u64, size: usize, protection: Protection, sharing: Sharing) -> Result<usize, i32>
    {
        let flags = match sharing {
            Sharing::Shared => libc::MAP_SHARED,
            Sharing::CopyOnWrite => libc::MAP_PRIVATE,
        };
        let offset = libc::off_t::try_from(offset).map_err(|_| libc::EINVAL)?;
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no Rust object.
        let address = unsafe { libc::mmap(std::ptr::null_mut(), size, protection.0, flags, fd, offset) };
        if address == libc::MAP_FAILED {
            Err(last_errno())
        } else {
            Ok(address as usize)
        }
    }

    fn unmap(&self, address: usize, size: usize) -> Result<(), i32>
    {
        // SAFETY: only called with a mapping this table created.
        if unsafe { libc::munmap(address as *mut libc::c_void, size) } == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn protect(&self, address: usize, size: usize, protection: Protection) -> Result<(), i32>
    {
        // SAFETY: only called with a mapping this table created.
        if unsafe { libc::mprotect(address as *mut libc::c_void, size, protection.0) } == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

#[cfg(unix)]
fn last_errno() -> i32
{
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// The process-wide table used for module files
#[cfg(unix)]
pub fn shared_views() -> &'static ViewTable<SystemMapper>
{
    static TABLE: once_cell::sync::Lazy<ViewTable<SystemMapper>> =
        once_cell::sync::Lazy::new(|| ViewTable::new(SystemMapper));
    &TABLE
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Hands out fake addresses; refuses shared maps with ENOMEM when told to.
    #[derive(Default)]
    struct FakeMapper
    {
        refuse_shared: AtomicBool,
        next: AtomicUsize,
        unmapped: Mutex<Vec<usize>>,
        protected: Mutex<Vec<(usize, Protection)>>,
    }

    impl MapBackend for Arc<FakeMapper>
    {
        fn map(&self, _fd: i32, _offset: u64, size: usize, _p: Protection, sharing: Sharing) -> Result<usize, i32>
        {
            if sharing == Sharing::Shared && self.refuse_shared.load(Ordering::SeqCst) {
                return Err(libc::ENOMEM);
            }
            Ok(0x10_0000 + self.next.fetch_add(size.max(0x1000), Ordering::SeqCst))
        }

        fn unmap(&self, address: usize, _size: usize) -> Result<(), i32>
        {
            self.unmapped.lock().unwrap().push(address);
            Ok(())
        }

        fn protect(&self, address: usize, _size: usize, protection: Protection) -> Result<(), i32>
        {
            self.protected.lock().unwrap().push((address, protection));
            Ok(())
        }
    }

    const KEY: FileKey = FileKey { device: 8, inode: 42 };

    #[test]
    fn test_contained_request_is_aliased()
    {
        let backend = Arc::new(FakeMapper::default());
        let table = ViewTable::new(backend.clone());
        let first = table.map_view(3, KEY, 0x1000, 0x4000, Protection::READ, Sharing::Shared).unwrap();

        backend.refuse_shared.store(true, Ordering::SeqCst);
        let alias = table
            .map_view(3, KEY, 0x2000, 0x1000, Protection::READ | Protection::WRITE, Sharing::Shared)
            .unwrap();

        assert_eq!(alias.address(), first.address() + 0x1000);
        assert_eq!(table.view_count(), 1);
        assert_eq!(table.refcount_at(first.address()), Some(2));
        assert_eq!(backend.protected.lock().unwrap().as_slice(), &[(first.address(), Protection(3))]);

        let base = first.address();
        table.unmap_view(alias).unwrap();
        assert!(backend.unmapped.lock().unwrap().is_empty());
        table.unmap_view(first).unwrap();
        assert_eq!(backend.unmapped.lock().unwrap().as_slice(), &[base]);
        assert_eq!(table.view_count(), 0);
    }

    #[test]
    fn test_overlapping_request_fails_without_dangling_entry()
    {
        let backend = Arc::new(FakeMapper::default());
        let table = ViewTable::new(backend.clone());
        let first = table.map_view(3, KEY, 0x1000, 0x2000, Protection::READ, Sharing::Shared).unwrap();

        backend.refuse_shared.store(true, Ordering::SeqCst);
        let err = table.map_view(3, KEY, 0x2000, 0x4000, Protection::READ, Sharing::Shared).unwrap_err();
        assert!(matches!(err, ShimError::NotEnoughMemory));
        assert_eq!(table.view_count(), 1);
        assert_eq!(table.refcount_at(first.address()), Some(1));
    }

    #[test]
    fn test_other_file_is_never_aliased()
    {
        let backend = Arc::new(FakeMapper::default());
        let table = ViewTable::new(backend.clone());
        let _first = table.map_view(3, KEY, 0, 0x2000, Protection::READ, Sharing::Shared).unwrap();

        backend.refuse_shared.store(true, Ordering::SeqCst);
        let other = FileKey { device: 8, inode: 43 };
        assert!(matches!(
            table.map_view(4, other, 0, 0x1000, Protection::READ, Sharing::Shared),
            Err(ShimError::NotEnoughMemory)
        ));
    }

    #[test]
    fn test_copy_on_write_views_are_not_registered()
    {
        let backend = Arc::new(FakeMapper::default());
        let table = ViewTable::new(backend.clone());
        let view = table.map_view(3, KEY, 0, 0x1000, Protection::READ, Sharing::CopyOnWrite).unwrap();
        assert_eq!(table.view_count(), 0);
        let address = view.address();
        table.unmap_view(view).unwrap();
        assert_eq!(backend.unmapped.lock().unwrap().as_slice(), &[address]);
    }
}
