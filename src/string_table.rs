//! String table resources.
//!
//! Strings are stored in bundles of 16. The string with id `n` is stored in slot `n & 0xF` of
//! bundle `n >> 4`, which is the `RT_STRING` resource with id `(n >> 4) + 1`.
//! See <https://learn.microsoft.com/en-us/windows/win32/menurc/stringtable-resource> for more information.

use alloc::{format, string::String, vec::Vec};

use log::debug;

use crate::{constants::*, errors::*, resource::*, util::*};

/// Bundle of 16 consecutive strings.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct StringTable {
    strings: [String; STRING_TABLE_BUNDLE_SIZE],
}
impl StringTable {
    /// Parse a string table bundle.
    /// Slots missing at the end of the data are empty.
    ///
    /// # Returns
    /// Returns an error if a string extends past the end of the data.
    pub fn parse(data: &[u8]) -> Result<Self, ResourceError> {
        let mut table = Self::default();
        let mut offset = 0;
        for slot in table.strings.iter_mut() {
            if offset + 2 > data.len() {
                break;
            }
            let length = read_at::<u16>(data, offset)? as usize;
            *slot = decode_u16(slice_at(data, offset + 2, length * 2)?);
            offset += 2 + length * 2;
        }
        Ok(table)
    }

    /// Build the bundle into resource data.
    pub fn build(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for string in &self.strings {
            let units = encode_u16(string);
            data.extend_from_slice(&((units.len() / 2) as u16).to_le_bytes());
            data.extend(units);
        }
        data
    }

    /// Returns the string in a slot of the bundle.
    pub fn get(&self, slot: usize) -> Option<&str> { self.strings.get(slot).map(String::as_str) }

    /// Set the string in a slot of the bundle.
    ///
    /// # Returns
    /// The previous string, or an error if the slot is out of range or the string is too long.
    pub fn set<S: Into<String>>(&mut self, slot: usize, string: S) -> Result<String, ResourceError> {
        let string = string.into();
        if string.encode_utf16().count() > u16::MAX as usize {
            return Err(ResourceError::InvalidArgument(format!(
                "string with {} bytes exceeds the maximum length",
                string.len()
            )));
        }
        let target = self
            .strings
            .get_mut(slot)
            .ok_or_else(|| ResourceError::InvalidArgument(format!("invalid string slot {}", slot)))?;
        Ok(core::mem::replace(target, string))
    }

    /// Returns the strings of the bundle.
    pub fn strings(&self) -> &[String] { &self.strings }
}

/// Returns the bundle id and the slot of a string id.
pub fn string_location(id: u32) -> Result<(u16, usize), ResourceError> {
    let id = u16::try_from(id)
        .map_err(|_| ResourceError::InvalidArgument(format!("string id {} exceeds 16 bits", id)))?;
    Ok((id >> 4, (id & 0xF) as usize))
}

impl ResourceDirectory {
    /// Get a string table bundle by bundle id.
    ///
    /// # Returns
    /// The bundle, or a `NotFound` error if the image has no such bundle.
    pub fn get_string_table(&self, bundle: u16) -> Result<StringTable, ResourceError> {
        let name = ResourceEntryName::ID(bundle as u32 + 1);
        match self.find(ResourceEntryName::from(RT_STRING), name, None) {
            Some(data) => StringTable::parse(data.data()),
            None => Err(ResourceError::NotFound(format!("string table bundle {}", bundle))),
        }
    }

    /// Get a string by string id.
    ///
    /// # Returns
    /// The string, which is empty for unused slots, or a `NotFound` error if the bundle of the string does not exist.
    pub fn get_resource_string(&self, id: u32) -> Result<String, ResourceError> {
        let (bundle, slot) = string_location(id)?;
        let table = self.get_string_table(bundle)?;
        Ok(table.get(slot).map(String::from).unwrap_or_default())
    }

    /// Set a string by string id.
    /// If the bundle of the string does not exist it is created with all other slots empty.
    /// An existing bundle keeps its language, new bundles are created for en-US.
    pub fn set_resource_string<S: Into<String>>(&mut self, id: u32, value: S) -> Result<(), ResourceError> {
        let (bundle, slot) = string_location(id)?;
        let type_ = ResourceEntryName::from(RT_STRING);
        let name = ResourceEntryName::ID(bundle as u32 + 1);
        let (mut table, language) = match self.resolve_language(&type_, &name, None) {
            Some(language) => (self.get_string_table(bundle)?, language),
            None => {
                debug!("creating string table bundle {}", bundle);
                (StringTable::default(), LANGUAGE_ID_EN_US)
            }
        };
        table.set(slot, value)?;
        self.upsert(type_, name, language, table.build())?;
        Ok(())
    }
}
