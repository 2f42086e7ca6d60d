//! Module files on disk presented as a data target.

use std::fs::File;
use std::path::{Path, PathBuf};

use super::DataTarget;
use crate::error::{ShimError, ShimResult};
use crate::types::{Address, Platform};

enum Backing
{
    #[cfg(unix)]
    Mapped(crate::mapping::MappedView),
    Owned(Vec<u8>),
}

/// The bytes of a module file, readable at target addresses `0..len`
///
/// On Unix the file is mapped read-only through the process-wide
/// [`crate::mapping::shared_views`] table; elsewhere it is read into memory.
/// The platform reported is the host's; identification code that cares
/// about the file format looks at the headers instead.
pub struct FileImage
{
    path: PathBuf,
    backing: Backing,
}

impl FileImage
{
    /// Open and map `path`
    ///
    /// ## Errors
    ///
    /// `Io` if the file can't be opened, mapping errors from the view table.
    pub fn open(path: impl AsRef<Path>) -> ShimResult<Self>
    {
        let path = path.as_ref();
        let file = File::open(path)?;
        let backing = Self::load(&file)?;
        tracing::trace!(path = %path.display(), len = Self::backing_len(&backing), "opened module file");
        Ok(FileImage { path: path.to_path_buf(), backing })
    }

    #[cfg(unix)]
    fn load(file: &File) -> ShimResult<Backing>
    {
        use std::os::unix::fs::MetadataExt;
        use std::os::unix::io::AsRawFd;

        use crate::mapping::{shared_views, FileKey, Protection, Sharing};

        let metadata = file.metadata()?;
        let len = usize::try_from(metadata.len()).map_err(|_| ShimError::NotEnoughMemory)?;
        if len == 0 {
            return Ok(Backing::Owned(Vec::new()));
        }
        let key = FileKey { device: metadata.dev(), inode: metadata.ino() };
        let view = shared_views().map_view(file.as_raw_fd(), key, 0, len, Protection::READ, Sharing::Shared)?;
        Ok(Backing::Mapped(view))
    }

    #[cfg(not(unix))]
    fn load(file: &File) -> ShimResult<Backing>
    {
        use std::io::Read;

        let mut bytes = Vec::new();
        let mut reader = file;
        reader.read_to_end(&mut bytes)?;
        Ok(Backing::Owned(bytes))
    }

    fn backing_len(backing: &Backing) -> usize
    {
        match backing {
            #[cfg(unix)]
            Backing::Mapped(view) => view.len(),
            Backing::Owned(bytes) => bytes.len(),
        }
    }

    /// Path the image was opened from
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// The whole file
    pub fn bytes(&self) -> &[u8]
    {
        match &self.backing {
            // SAFETY: the view stays mapped read-only until `self` is dropped.
            #[cfg(unix)]
            Backing::Mapped(view) => unsafe { std::slice::from_raw_parts(view.address() as *const u8, view.len()) },
            Backing::Owned(bytes) => bytes,
        }
    }
}

impl Drop for FileImage
{
    fn drop(&mut self)
    {
        #[cfg(unix)]
        if let Backing::Mapped(view) = std::mem::replace(&mut self.backing, Backing::Owned(Vec::new())) {
            if let Err(err) = crate::mapping::shared_views().unmap_view(view) {
                tracing::warn!(path = %self.path.display(), %err, "failed to unmap module file");
            }
        }
    }
}

impl DataTarget for FileImage
{
    fn platform(&self) -> ShimResult<Platform>
    {
        Ok(Platform::host())
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        let bytes = self.bytes();
        let offset = usize::try_from(address.value())
            .ok()
            .filter(|offset| *offset < bytes.len())
            .ok_or(ShimError::PartialCopy(address.value()))?;
        let count = buffer.len().min(bytes.len() - offset);
        buffer[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }
}

impl std::fmt::Debug for FileImage
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("FileImage").field("path", &self.path).field("len", &self.bytes().len()).finish()
    }
}
