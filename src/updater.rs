//! Loading, modifying and committing an image file.

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{errors::*, image::*, resource::*, version::*};

const ICO_SIGNATURE: [u8; 4] = [0, 0, 1, 0];

/// Resource updater for an image file.
///
/// The image is read once by [`ResourceUpdater::load`]. All modifications are applied to an in-memory copy of its
/// resource directory and written back to the file by [`ResourceUpdater::commit`].
#[derive(Debug, Clone)]
pub struct ResourceUpdater {
    path:      PathBuf,
    image:     Image<'static>,
    resources: ResourceDirectory,
}

impl ResourceUpdater {
    /// Load an image file.
    ///
    /// # Returns
    /// Returns an error if the file could not be read or is not a valid portable executable image.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, UpdateError> {
        let path = path.as_ref().to_path_buf();
        info!("loading {}", path.display());
        let image = Image::parse_file(&path)?;
        let resources = image.resource_directory().cloned().unwrap_or_default();
        debug!("loaded resource directory with {} bytes", resources.size());
        Ok(Self {
            path,
            image,
            resources,
        })
    }

    /// Returns the path of the image file.
    pub fn path(&self) -> &Path { &self.path }

    /// Returns the image as of the last load or commit.
    pub fn image(&self) -> &Image<'static> { &self.image }

    /// Returns the resource directory with all pending changes.
    pub fn resources(&self) -> &ResourceDirectory { &self.resources }

    pub fn resources_mut(&mut self) -> &mut ResourceDirectory { &mut self.resources }

    /// Returns the version information with all pending changes, or `None` if the image has no version resource.
    pub fn version_info(&self) -> Result<Option<VersionInfo>, UpdateError> {
        Ok(self.resources.get_version_info()?)
    }

    fn modify_version_info<T, F: FnOnce(&mut VersionInfo) -> Result<T, ResourceError>>(
        &mut self, modify: F,
    ) -> Result<T, UpdateError> {
        let mut version_info = match self.resources.get_version_info()? {
            Some(version_info) => version_info,
            None => {
                debug!("creating version info");
                VersionInfo::default()
            }
        };
        let result = modify(&mut version_info)?;
        self.resources.set_version_info(&version_info)?;
        Ok(result)
    }

    /// Set a version string such as `CompanyName` or `FileDescription`.
    /// Version information is created if the image has none.
    pub fn set_version_string<K: AsRef<str>, V: AsRef<str>>(
        &mut self, key: K, value: V,
    ) -> Result<(), UpdateError> {
        debug!("setting version string {} to {}", key.as_ref(), value.as_ref());
        self.modify_version_info(|version_info| version_info.set_string(key, value).map(|_| ()))
    }

    /// Get a version string.
    ///
    /// # Returns
    /// The value, or a `NotFound` error if the image has no such version string.
    pub fn get_version_string<K: AsRef<str>>(&self, key: K) -> Result<String, UpdateError> {
        let key = key.as_ref();
        self.version_info()?
            .and_then(|version_info| version_info.get_string(key).map(String::from))
            .ok_or_else(|| ResourceError::NotFound(format!("version string {}", key)).into())
    }

    /// Set the numeric file version in the fixed file info.
    /// Version information is created if the image has none.
    pub fn set_file_version(&mut self, version: [u16; 4]) -> Result<(), UpdateError> {
        debug!("setting file version to {:?}", version);
        self.modify_version_info(|version_info| {
            version_info.set_file_version(version);
            Ok(())
        })
    }

    /// Set the numeric product version in the fixed file info.
    /// Version information is created if the image has none.
    pub fn set_product_version(&mut self, version: [u16; 4]) -> Result<(), UpdateError> {
        debug!("setting product version to {:?}", version);
        self.modify_version_info(|version_info| {
            version_info.set_product_version(version);
            Ok(())
        })
    }

    /// Replace the main icon of the image with an icon file.
    /// With the `images` feature, other image formats are converted into an icon first.
    pub fn set_icon<P: AsRef<Path>>(&mut self, path: P) -> Result<(), UpdateError> {
        let path = path.as_ref();
        debug!("setting icon from {}", path.display());
        let data = std::fs::read(path).map_err(ResourceError::from)?;
        self.set_icon_data(&data)
    }

    /// Replace the main icon of the image with the data of an icon file.
    /// With the `images` feature, other image formats are converted into an icon first.
    pub fn set_icon_data(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        let icon = icon_data(data)?;
        Ok(self.resources.set_icon(&icon)?)
    }

    /// Set a string table entry.
    /// The bundle containing the string is created if it does not exist.
    pub fn change_string<S: Into<String>>(&mut self, id: u32, value: S) -> Result<(), UpdateError> {
        let value = value.into();
        debug!("setting string {} to {}", id, value);
        Ok(self.resources.set_resource_string(id, value)?)
    }

    /// Get a string table entry.
    ///
    /// # Returns
    /// The string, or a `NotFound` error if the bundle containing the string does not exist.
    pub fn get_string(&self, id: u32) -> Result<String, UpdateError> {
        Ok(self.resources.get_resource_string(id)?)
    }

    /// Write the image with all changes applied back to its file.
    ///
    /// The image is written to a temporary file next to the target which then replaces the target,
    /// so the target is left untouched if an error occurs.
    /// Committing again without further changes writes an identical file.
    pub fn commit(&mut self) -> Result<(), UpdateError> {
        let mut image = self.image.clone();
        image.set_resource_directory(self.resources.clone())?;

        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        debug!("writing {} bytes to {}", image.data().len(), file.path().display());
        image.write_writer(&mut file)?;
        file.as_file().sync_all()?;
        if let Ok(metadata) = std::fs::metadata(&self.path) {
            file.as_file().set_permissions(metadata.permissions())?;
        }
        file.persist(&self.path).map_err(|error| error.error)?;
        info!("wrote {}", self.path.display());

        self.image = image;
        Ok(())
    }
}

#[cfg(feature = "images")]
fn icon_data(data: &[u8]) -> Result<Cow<'_, [u8]>, ResourceError> {
    if data.starts_with(&ICO_SIGNATURE) {
        return Ok(Cow::Borrowed(data));
    }
    debug!("converting image into icon");
    Ok(Cow::Owned(crate::icon::IconFile::from_image(data)?))
}

#[cfg(not(feature = "images"))]
fn icon_data(data: &[u8]) -> Result<Cow<'_, [u8]>, ResourceError> {
    if !data.starts_with(&ICO_SIGNATURE) {
        debug!("icon data does not start with an icon header");
    }
    Ok(Cow::Borrowed(data))
}
