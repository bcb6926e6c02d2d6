//! Icon files and icon group resources.
//!
//! An `.ico` file contains a directory of images addressed by file offset.
//! In an image the same images are stored as individual `RT_ICON` resources,
//! and an `RT_GROUP_ICON` resource lists them by resource id.

use alloc::{format, string::ToString, vec::Vec};

use log::debug;
use zerocopy::IntoBytes;

use crate::{constants::*, errors::*, resource::*, types::*, util::*};

/// Parsed `.ico` file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IconFile<'a> {
    entries: Vec<(IconFileDirectoryEntry, &'a [u8])>,
}
impl<'a> IconFile<'a> {
    /// Parse an `.ico` file.
    ///
    /// # Returns
    /// Returns an error if the header is invalid, the file contains no images,
    /// or an image extends past the end of the file.
    pub fn parse(data: &'a [u8]) -> Result<Self, ResourceError> {
        let header = read::<IconDirectory>(data)?;
        if header.reserved != 0 || header.type_ != ICO_TYPE_ICON {
            return Err(ResourceError::InvalidIcon("not an icon file".to_string()));
        }
        if header.count == 0 {
            return Err(ResourceError::InvalidIcon("icon file contains no images".to_string()));
        }
        let mut entries = Vec::with_capacity(header.count as usize);
        for index in 0..header.count as usize {
            let entry =
                read_at::<IconFileDirectoryEntry>(data, ICO_HEADER_SIZE + index * ICO_ENTRY_SIZE)?;
            let image = slice_at(data, entry.offset as usize, entry.bytes as usize).map_err(|_| {
                ResourceError::InvalidIcon(format!(
                    "image {} with {:#x} bytes at {:#x} exceeds file size {:#x}",
                    index,
                    { entry.bytes },
                    { entry.offset },
                    data.len()
                ))
            })?;
            debug!(
                "icon image {}: {}x{}, {} bpp, {:#x} bytes",
                index,
                { entry.width },
                { entry.height },
                { entry.bit_count },
                image.len()
            );
            entries.push((entry, image));
        }
        Ok(Self { entries })
    }

    /// Returns the number of images in the file.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Returns whether the file contains no images.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Build the group resource and the image resources with ids assigned starting at `first_id`.
    ///
    /// # Returns
    /// Returns an error if the ids would exceed the 16-bit id range.
    pub fn build_resources(&self, first_id: u16) -> Result<(IconGroup, Vec<(u16, Vec<u8>)>), ResourceError> {
        let mut group = IconGroup::default();
        let mut images = Vec::with_capacity(self.entries.len());
        for (index, (entry, image)) in self.entries.iter().enumerate() {
            let id = u16::try_from(first_id as usize + index)
                .map_err(|_| ResourceError::InvalidTable("icon ids exhausted".to_string()))?;
            group.entries.push(IconDirectoryEntry {
                width: entry.width,
                height: entry.height,
                color_count: entry.color_count,
                reserved: entry.reserved,
                planes: entry.planes,
                bit_count: entry.bit_count,
                bytes: entry.bytes,
                id,
            });
            images.push((id, image.to_vec()));
        }
        Ok((group, images))
    }

    /// Convert an image in any supported format into an `.ico` file with common icon sizes.
    #[cfg(feature = "images")]
    pub fn from_image(data: &[u8]) -> Result<Vec<u8>, ResourceError> {
        use image::{codecs::ico::*, imageops::FilterType, ExtendedColorType};

        let source = image::load_from_memory(data)?.into_rgba8();
        let mut frames = Vec::new();
        for size in [256, 128, 64, 48, 32, 16] {
            let resized = image::imageops::resize(&source, size, size, FilterType::Lanczos3);
            frames.push(IcoFrame::as_png(resized.as_raw(), size, size, ExtendedColorType::Rgba8)?);
        }
        let mut icon = Vec::new();
        IcoEncoder::new(&mut icon).encode_images(&frames)?;
        Ok(icon)
    }
}

/// Icon group resource, listing the images of an icon by resource id.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct IconGroup {
    pub entries: Vec<IconDirectoryEntry>,
}
impl IconGroup {
    /// Parse an icon group resource.
    pub fn parse(data: &[u8]) -> Result<Self, ResourceError> {
        let header = read::<IconDirectory>(data)?;
        let mut entries = Vec::with_capacity(header.count as usize);
        for index in 0..header.count as usize {
            entries.push(read_at::<IconDirectoryEntry>(
                data,
                ICO_HEADER_SIZE + index * GROUP_ICON_ENTRY_SIZE,
            )?);
        }
        Ok(Self { entries })
    }

    /// Build the icon group into resource data.
    pub fn build(&self) -> Vec<u8> {
        let header = IconDirectory {
            reserved: 0,
            type_:    ICO_TYPE_ICON,
            count:    self.entries.len() as u16,
        };
        let mut data = Vec::from(header.as_bytes());
        for entry in &self.entries {
            data.extend_from_slice(entry.as_bytes());
        }
        data
    }

    /// Returns the resource ids of the images in the group.
    pub fn ids(&self) -> Vec<u16> { self.entries.iter().map(|entry| entry.id).collect() }
}

impl ResourceDirectory {
    /// Get the first icon group of the image.
    /// This is the icon shown for the executable.
    pub fn get_icon_group(&self) -> Result<Option<IconGroup>, ResourceError> {
        let Some(name) = self.icon_group_name() else {
            return Ok(None);
        };
        match self.find(ResourceEntryName::from(RT_GROUP_ICON), name, None) {
            Some(data) => Ok(Some(IconGroup::parse(data.data())?)),
            None => Ok(None),
        }
    }

    /// Get the image data of the icon resource with the given id.
    pub fn get_icon_image(&self, id: u16) -> Option<&[u8]> {
        self.find(ResourceEntryName::from(RT_ICON), ResourceEntryName::from(id), None)
            .map(ResourceData::data)
    }

    /// Build the resources for an icon file without modifying the directory.
    /// Image ids are assigned increasing from above the highest existing icon id.
    pub fn build_icon_resources(
        &self, icon: &IconFile,
    ) -> Result<(IconGroup, Vec<(u16, Vec<u8>)>), ResourceError> {
        let highest_id = self
            .names(ResourceEntryName::from(RT_ICON))
            .into_iter()
            .filter_map(|name| match name {
                ResourceEntryName::ID(id) => Some(*id),
                ResourceEntryName::Name(_) => None,
            })
            .max()
            .unwrap_or(0);
        let first_id = u16::try_from(highest_id.saturating_add(1))
            .map_err(|_| ResourceError::InvalidTable("icon ids exhausted".to_string()))?;
        icon.build_resources(first_id)
    }

    /// Set the main icon of the image from the data of an `.ico` file.
    ///
    /// The first icon group and its images are replaced. The group keeps its name and language,
    /// or is created with id 1 for en-US if the image has no icon.
    /// The directory is only modified if the icon file is valid.
    pub fn set_icon(&mut self, icon: &[u8]) -> Result<(), ResourceError> {
        let icon = IconFile::parse(icon)?;
        let (group, images) = self.build_icon_resources(&icon)?;

        let group_type = ResourceEntryName::from(RT_GROUP_ICON);
        let name = self.icon_group_name().unwrap_or(ResourceEntryName::ID(1));
        let language = self.resolve_language(&group_type, &name, None).unwrap_or(LANGUAGE_ID_EN_US);
        debug!("replacing icon group {:?} ({}) with {} images", name, language, images.len());

        // the group and its images are replaced together or not at all
        let mut directory = self.clone();
        directory.remove_icon()?;
        for (id, image) in images {
            directory.upsert(
                ResourceEntryName::from(RT_ICON),
                ResourceEntryName::from(id),
                language,
                image,
            )?;
        }
        directory.upsert(group_type, name, language, group.build())?;
        *self = directory;
        Ok(())
    }

    /// Remove the first icon group and the images it references.
    ///
    /// # Returns
    /// The removed icon group, or `None` if the image has no icon.
    pub fn remove_icon(&mut self) -> Result<Option<IconGroup>, ResourceError> {
        let Some(group) = self.get_icon_group()? else {
            return Ok(None);
        };
        for id in group.ids() {
            self.remove(ResourceEntryName::from(RT_ICON), ResourceEntryName::from(id));
        }
        if let Some(name) = self.icon_group_name() {
            self.remove(ResourceEntryName::from(RT_GROUP_ICON), name);
        }
        Ok(Some(group))
    }

    fn icon_group_name(&self) -> Option<ResourceEntryName> {
        self.names(ResourceEntryName::from(RT_GROUP_ICON)).first().map(|&name| name.clone())
    }
}
