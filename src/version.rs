//! Version information resource.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/menurc/vs-versioninfo> for more information.

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::mem::size_of;

use ahash::RandomState;
use indexmap::IndexMap;
use log::{trace, warn};
use zerocopy::IntoBytes;

use crate::{constants::*, errors::*, resource::*, types::*, util::*};

const HEADER_SIZE: usize = size_of::<VersionHeader>();
const FIXED_FILE_INFO_SIZE: usize = size_of::<FixedFileInfo>();
const TYPE_BINARY: u16 = 0;
const TYPE_TEXT: u16 = 1;

/// Version strings of one language and code page, in insertion order.
pub type VersionStrings = IndexMap<String, String, RandomState>;

/// Version information of an image.
///
/// The numeric versions in the fixed file info and the `FileVersion` and `ProductVersion` strings
/// are independent of each other and have to be updated separately.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionInfo {
    pub info:         FixedFileInfo,
    pub strings:      IndexMap<Translation, VersionStrings, RandomState>,
    pub translations: Vec<Translation>,
}
impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            info:         FixedFileInfo::default(),
            strings:      IndexMap::with_hasher(RandomState::new()),
            translations: Vec::new(),
        }
    }
}

/// Generic version information node: a header, a key, a value and child nodes.
struct Node<'a> {
    key:      String,
    type_:    u16,
    value:    &'a [u8],
    children: &'a [u8],
}
impl<'a> Node<'a> {
    /// Parse a node at the start of the data.
    ///
    /// # Returns
    /// The node and its length without trailing padding.
    fn parse(data: &'a [u8]) -> Result<(Self, usize), ResourceError> {
        let header = read::<VersionHeader>(data)?;
        let length = header.length as usize;
        if length < HEADER_SIZE || length > data.len() {
            return Err(ResourceError::InvalidVersionInfo(format!(
                "node length {:#x} outside parent length {:#x}",
                length,
                data.len()
            )));
        }
        let data = &data[..length];
        let (key, key_size) = read_u16_string(&data[HEADER_SIZE..]);
        let value_offset = aligned_to(HEADER_SIZE + key_size, 4).min(length);

        let value_size = match (header.type_, header.value_length) {
            (TYPE_TEXT, 0) => 0,
            // text values are read up to their terminator, some linkers store the length in bytes
            (TYPE_TEXT, _) => read_u16_string(&data[value_offset..]).1,
            (_, value_length) => value_length as usize,
        };
        let value = slice_at(data, value_offset, value_size).map_err(|_| {
            ResourceError::InvalidVersionInfo(format!("value of {} outside node", key))
        })?;
        let children_offset = aligned_to(value_offset + value_size, 4).min(length);
        trace!("version node {} ({:#x} bytes, {} value bytes)", key, length, value.len());

        Ok((
            Self {
                key,
                type_: header.type_,
                value,
                children: &data[children_offset..],
            },
            length,
        ))
    }

    /// Parse all nodes following each other in the data.
    fn parse_all(mut data: &'a [u8]) -> Result<Vec<Self>, ResourceError> {
        let mut nodes = Vec::new();
        while data.len() >= HEADER_SIZE {
            if read::<u16>(data)? == 0 {
                // trailing padding
                break;
            }
            let (node, length) = Node::parse(data)?;
            nodes.push(node);
            data = &data[aligned_to(length, 4).min(data.len())..];
        }
        Ok(nodes)
    }

    fn build<F: FnOnce(&mut Vec<u8>) -> Result<(), ResourceError>>(
        target: &mut Vec<u8>, key: &str, type_: u16, value_length: usize, value: &[u8], children: F,
    ) -> Result<(), ResourceError> {
        let start = target.len();
        target.extend_from_slice(VersionHeader::default().as_bytes());
        target.extend(string_to_u16(key));
        pad_to(target, 4);
        target.extend_from_slice(value);
        pad_to(target, 4);
        children(target)?;
        pad_to(target, 4);
        let header = VersionHeader {
            length: node_length(key, target.len() - start)?,
            value_length: node_length(key, value_length)?,
            type_,
        };
        target[start..start + HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }
}

impl VersionInfo {
    /// Parse version information from resource data.
    ///
    /// # Returns
    /// Returns an error if the data is truncated, the fixed file info signature is invalid
    /// or a child node exceeds the length of its parent.
    pub fn parse(data: &[u8]) -> Result<Self, ResourceError> {
        let (root, _) = Node::parse(data)?;
        if root.key != VS_VERSION_INFO_KEY {
            return Err(ResourceError::InvalidVersionInfo(format!("unexpected root key {}", root.key)));
        }
        if root.value.len() < FIXED_FILE_INFO_SIZE {
            return Err(ResourceError::InvalidVersionInfo("missing fixed file info".to_string()));
        }
        let info = read::<FixedFileInfo>(root.value)?;
        if info.signature != VS_FIXEDFILEINFO_SIGNATURE {
            return Err(ResourceError::InvalidVersionInfo(format!(
                "invalid fixed file info signature {:#x}",
                { info.signature }
            )));
        }

        let mut version_info = VersionInfo {
            info,
            ..Default::default()
        };
        for child in Node::parse_all(root.children)? {
            match child.key.as_str() {
                VS_STRING_FILE_INFO_KEY => {
                    for table in Node::parse_all(child.children)? {
                        let translation = parse_translation_key(&table.key)?;
                        let strings = version_info
                            .strings
                            .entry(translation)
                            .or_insert_with(|| IndexMap::with_hasher(RandomState::new()));
                        for string in Node::parse_all(table.children)? {
                            let (value, _) = read_u16_string(string.value);
                            strings.insert(string.key, value);
                        }
                    }
                }
                VS_VAR_FILE_INFO_KEY => {
                    for var in Node::parse_all(child.children)? {
                        if var.key != VS_TRANSLATION_KEY || var.type_ != TYPE_BINARY {
                            warn!("ignoring unknown version variable {}", var.key);
                            continue;
                        }
                        for pair in var.value.chunks_exact(size_of::<Translation>()) {
                            version_info.translations.push(read::<Translation>(pair)?);
                        }
                    }
                }
                key => warn!("ignoring unknown version info block {}", key),
            }
        }
        Ok(version_info)
    }

    /// Build the version information into resource data.
    /// Every node is padded to a 4 byte boundary and its length includes the padding.
    ///
    /// # Returns
    /// Returns an error if a node length does not fit into 16 bits.
    pub fn build(&self) -> Result<Vec<u8>, ResourceError> {
        let mut data = Vec::new();
        Node::build(
            &mut data,
            VS_VERSION_INFO_KEY,
            TYPE_BINARY,
            FIXED_FILE_INFO_SIZE,
            self.info.as_bytes(),
            |data| {
                if !self.strings.is_empty() {
                    Node::build(data, VS_STRING_FILE_INFO_KEY, TYPE_TEXT, 0, &[], |data| {
                        for (translation, strings) in &self.strings {
                            let key = format!(
                                "{:04X}{:04X}",
                                { translation.language },
                                { translation.codepage }
                            );
                            Node::build(data, &key, TYPE_TEXT, 0, &[], |data| {
                                for (key, value) in strings {
                                    let value = string_to_u16(value);
                                    let length = value.len() / 2;
                                    Node::build(data, key, TYPE_TEXT, length, &value, |_| Ok(()))?;
                                }
                                Ok(())
                            })?;
                        }
                        Ok(())
                    })?;
                }
                if !self.translations.is_empty() {
                    Node::build(data, VS_VAR_FILE_INFO_KEY, TYPE_TEXT, 0, &[], |data| {
                        let value = self.translations.as_bytes();
                        Node::build(data, VS_TRANSLATION_KEY, TYPE_BINARY, value.len(), value, |_| Ok(()))
                    })?;
                }
                Ok(())
            },
        )?;
        Ok(data)
    }

    /// Set the numeric file version in the fixed file info.
    pub fn set_file_version(&mut self, version: [u16; 4]) { self.info.set_file_version(version); }

    /// Set the numeric product version in the fixed file info.
    pub fn set_product_version(&mut self, version: [u16; 4]) {
        self.info.set_product_version(version);
    }

    /// Set a version string in the first string table.
    /// If no string table exists, one for en-US and UTF-16 is created and added to the translations.
    ///
    /// # Returns
    /// The replaced value, or an error if the key is empty or the version information
    /// would exceed the 16-bit node lengths with the new value.
    pub fn set_string<K: AsRef<str>, V: AsRef<str>>(
        &mut self, key: K, value: V,
    ) -> Result<Option<String>, ResourceError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ResourceError::EmptyKey);
        }
        let mut updated = self.clone();
        let previous = updated.insert_string(key, value.as_ref());
        if updated.build().is_err() {
            return Err(ResourceError::InvalidArgument(format!(
                "version string {} does not fit into the version information",
                key
            )));
        }
        *self = updated;
        Ok(previous)
    }

    fn insert_string(&mut self, key: &str, value: &str) -> Option<String> {
        if self.strings.is_empty() {
            let translation = Translation {
                language: LANGUAGE_ID_EN_US,
                codepage: CODE_PAGE_ID_EN_US,
            };
            self.strings.insert(translation, IndexMap::with_hasher(RandomState::new()));
            if !self.translations.contains(&translation) {
                self.translations.push(translation);
            }
        }
        let strings = self.strings.get_index_mut(0).map(|(_, strings)| strings);
        strings.and_then(|strings| strings.insert(key.to_string(), value.to_string()))
    }

    /// Returns a version string from the first string table containing the key.
    pub fn get_string<K: AsRef<str>>(&self, key: K) -> Option<&str> {
        self.strings.values().find_map(|strings| strings.get(key.as_ref())).map(String::as_str)
    }
}

fn node_length(key: &str, length: usize) -> Result<u16, ResourceError> {
    u16::try_from(length).map_err(|_| {
        ResourceError::InvalidVersionInfo(format!("node {} exceeds {:#x} bytes", key, u16::MAX))
    })
}

fn parse_translation_key(key: &str) -> Result<Translation, ResourceError> {
    let invalid = || ResourceError::InvalidVersionInfo(format!("invalid string table key {}", key));
    if key.len() != 8 || !key.is_ascii() {
        return Err(invalid());
    }
    Ok(Translation {
        language: u16::from_str_radix(&key[..4], 16).map_err(|_| invalid())?,
        codepage: u16::from_str_radix(&key[4..], 16).map_err(|_| invalid())?,
    })
}

impl ResourceDirectory {
    /// Get the version information of the image.
    ///
    /// # Returns
    /// The parsed version information, `None` if the image has no version resource,
    /// or an error if the version resource is invalid.
    pub fn get_version_info(&self) -> Result<Option<VersionInfo>, ResourceError> {
        let Some(name) = self.version_info_name() else {
            return Ok(None);
        };
        match self.find(ResourceEntryName::from(RT_VERSION), name, None) {
            Some(data) => Ok(Some(VersionInfo::parse(data.data())?)),
            None => Ok(None),
        }
    }

    /// Set the version information of the image.
    /// An existing version resource keeps its name and language, otherwise it is created with id 1 for en-US.
    pub fn set_version_info(&mut self, version_info: &VersionInfo) -> Result<(), ResourceError> {
        let type_ = ResourceEntryName::from(RT_VERSION);
        let name = self.version_info_name().unwrap_or(ResourceEntryName::from(VS_VERSION_INFO_ID));
        let language =
            self.resolve_language(&type_, &name, None).unwrap_or(LANGUAGE_ID_EN_US);
        self.upsert(type_, name, language, version_info.build()?)?;
        Ok(())
    }

    fn version_info_name(&self) -> Option<ResourceEntryName> {
        self.names(ResourceEntryName::from(RT_VERSION)).first().map(|&name| name.clone())
    }
}
