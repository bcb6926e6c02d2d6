//! Errors specific to reading, writing or modifying a PE image.

use alloc::string::String;

#[cfg(feature = "images")]
use image::ImageError;
#[cfg(feature = "std")]
use std::io::Error as IOError;

/// Error that can occur when reading and parsing bytes.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(feature = "std", error("{0}"))]
pub struct ReadError(pub String);

/// Errors that can occur when reading a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageReadError {
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("invalid header: {0}"))]
    InvalidHeader(String),
    #[cfg_attr(feature = "std", error("invalid section: {0}"))]
    InvalidSection(String),
    #[cfg_attr(feature = "std", error("invalid resource table: {0}"))]
    InvalidResourceTable(String),
    #[cfg(feature = "std")]
    #[error("io error: {0}")]
    IOError(IOError),
}
impl From<ReadError> for ImageReadError {
    fn from(error: ReadError) -> Self { ImageReadError::InvalidBytes(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for ImageReadError {
    fn from(error: IOError) -> Self { ImageReadError::IOError(error) }
}

/// Errors that can occur when writing a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageWriteError {
    #[cfg_attr(feature = "std", error("not enough space in file header"))]
    NotEnoughSpaceInHeader,
    #[cfg_attr(feature = "std", error("section points outside image: {0} > {1}"))]
    InvalidSectionRange(u64, u64),
    #[cfg_attr(feature = "std", error("invalid alignment: file {0:#x}, section {1:#x}"))]
    InvalidAlignment(u32, u32),
    #[cfg_attr(feature = "std", error("resource section exceeds the address space"))]
    AddressOverflow,
    #[cfg(feature = "std")]
    #[error("io error: {0}")]
    IOError(IOError),
}
#[cfg(feature = "std")]
impl From<IOError> for ImageWriteError {
    fn from(error: IOError) -> Self { ImageWriteError::IOError(error) }
}

/// Errors that can occur when modifying resource data.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ResourceError {
    #[cfg_attr(feature = "std", error("invalid table: {0}"))]
    InvalidTable(String),
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("invalid version info: {0}"))]
    InvalidVersionInfo(String),
    #[cfg_attr(feature = "std", error("invalid icon: {0}"))]
    InvalidIcon(String),
    #[cfg(feature = "images")]
    #[error("invalid icon image: {0}")]
    InvalidIconImage(ImageError),
    #[cfg_attr(feature = "std", error("empty version string key"))]
    EmptyKey,
    #[cfg_attr(feature = "std", error("invalid argument: {0}"))]
    InvalidArgument(String),
    #[cfg_attr(feature = "std", error("resource not found: {0}"))]
    NotFound(String),
    #[cfg(feature = "std")]
    #[error("io error: {0}")]
    IOError(IOError),
}
impl From<ReadError> for ResourceError {
    fn from(error: ReadError) -> Self { ResourceError::InvalidBytes(error) }
}
#[cfg(feature = "images")]
impl From<ImageError> for ResourceError {
    fn from(error: ImageError) -> Self { ResourceError::InvalidIconImage(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for ResourceError {
    fn from(error: IOError) -> Self { ResourceError::IOError(error) }
}

/// Classification of errors returned by [`ResourceUpdater`](crate::ResourceUpdater) operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed PE image, icon file or resource data.
    Format,
    /// The modified resource section can not be represented in the image.
    Layout,
    /// An explicitly requested resource does not exist.
    NotFound,
    /// An argument was rejected, such as an empty version string key.
    InvalidArgument,
    /// Reading or writing a file failed.
    IO,
}

/// Errors that can occur when loading, modifying or committing an image with a [`ResourceUpdater`](crate::ResourceUpdater).
#[cfg(feature = "std")]
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("unable to read image: {0}")]
    Read(ImageReadError),
    #[error("unable to write image: {0}")]
    Write(ImageWriteError),
    #[error("unable to modify resources: {0}")]
    Resource(ResourceError),
    #[error("io error: {0}")]
    IOError(IOError),
}
#[cfg(feature = "std")]
impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Read(ImageReadError::IOError(_))
            | UpdateError::Write(ImageWriteError::IOError(_))
            | UpdateError::Resource(ResourceError::IOError(_))
            | UpdateError::IOError(_) => ErrorKind::IO,
            UpdateError::Read(_) => ErrorKind::Format,
            UpdateError::Write(_) => ErrorKind::Layout,
            UpdateError::Resource(ResourceError::NotFound(_)) => ErrorKind::NotFound,
            UpdateError::Resource(ResourceError::EmptyKey | ResourceError::InvalidArgument(_)) => {
                ErrorKind::InvalidArgument
            }
            UpdateError::Resource(_) => ErrorKind::Format,
        }
    }
}
#[cfg(feature = "std")]
impl From<ImageReadError> for UpdateError {
    fn from(error: ImageReadError) -> Self { UpdateError::Read(error) }
}
#[cfg(feature = "std")]
impl From<ImageWriteError> for UpdateError {
    fn from(error: ImageWriteError) -> Self { UpdateError::Write(error) }
}
#[cfg(feature = "std")]
impl From<ResourceError> for UpdateError {
    fn from(error: ResourceError) -> Self { UpdateError::Resource(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for UpdateError {
    fn from(error: IOError) -> Self { UpdateError::IOError(error) }
}
