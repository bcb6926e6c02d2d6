//! Data types for parsing and building the resource section.
//! The resource section contains the resource directory and the resource data.
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#the-rsrc-section> for more information.

use alloc::{
    collections::{BTreeSet, VecDeque},
    format,
    string::String,
    vec::Vec,
};
use core::{borrow::Borrow, cmp::Ordering, mem::size_of};

use ahash::RandomState;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use log::trace;
use zerocopy::IntoBytes;

use crate::{constants::*, errors::*, types::*, util::*};

const HIGH_BIT: u32 = 0x80000000;
const TABLE_HEADER_SIZE: u32 = size_of::<ResourceDirectoryTable>() as u32;
const TABLE_ENTRY_SIZE: u32 = size_of::<ResourceDirectoryEntry>() as u32;
const DATA_ENTRY_SIZE: u32 = size_of::<ResourceDataEntry>() as u32;
// type, name and language tables below the root table
const LANGUAGE_LEVEL: usize = 2;
const DATA_ALIGNMENT: u32 = 8;


/// Portable executable resource directory.
///
/// The directory is a tree of three table levels: the root table is keyed by resource type,
/// its child tables by resource name or id, and their child tables by language id.
/// Only language tables contain resource data.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceDirectory {
    pub(crate) virtual_address: u32,
    pub(crate) root:            ResourceTable,
}
impl ResourceDirectory {
    /// Parse the resource directory from the raw data of the section containing it.
    /// The offset is the position of the root table in the section, the virtual address is the virtual address of the section.
    /// The virtual address is used to resolve the resource data offsets and has to correspond to the virtual address in the section table header of the source image.
    ///
    /// # Returns
    /// Returns an error if the resource directory is invalid, contains a cycle, does not have the expected depth,
    /// or references data outside the section.
    pub fn parse(section: &[u8], offset: u32, virtual_address: u32) -> Result<Self, ImageReadError> {
        let mut parser = TableParser {
            section,
            base: offset,
            virtual_address,
            visited: BTreeSet::new(),
        };
        let root = ResourceTable::parse(&mut parser, 0, 0)?;
        Ok(Self {
            virtual_address: virtual_address + offset,
            root,
        })
    }

    /// Returns the virtual address of the resource directory in the source image.
    pub fn virtual_address(&self) -> u32 { self.virtual_address }

    /// Returns the root resource table.
    /// The root resource table contains the top-level resource entries.
    pub fn root(&self) -> &ResourceTable { &self.root }

    /// Returns the mutable root resource table.
    /// The root resource table contains the top-level resource entries.
    pub fn root_mut(&mut self) -> &mut ResourceTable { &mut self.root }

    /// Returns the size of the resulting resource directory in bytes.
    pub fn size(&self) -> u32 { self.root.size() }

    /// Build the resource directory into raw bytes to be included in an image.
    /// The virtual address is used to compute the resource data offsets and has to correspond to the virtual address the directory is placed at in the target image.
    pub fn build(&self, virtual_address: u32) -> Vec<u8> { self.root.build(virtual_address) }

    /// Returns the language a lookup of the resource resolves to.
    ///
    /// If a language is given, only that language is considered.
    /// Otherwise the neutral language is preferred, followed by the first language in the table.
    pub fn resolve_language<T: Borrow<ResourceEntryName>, N: Borrow<ResourceEntryName>>(
        &self, type_: T, name: N, language: Option<LANGID>,
    ) -> Option<LANGID> {
        let table = self.root.get(type_)?.as_table()?.get(name)?.as_table()?;
        match language {
            Some(language) => {
                table.get(ResourceEntryName::ID(language as u32)).map(|_| language)
            }
            None => {
                if table.get(ResourceEntryName::ID(LANGUAGE_ID_NEUTRAL as u32)).is_some() {
                    return Some(LANGUAGE_ID_NEUTRAL);
                }
                table.entries.iter().find_map(|(name, entry)| match (name, entry) {
                    (ResourceEntryName::ID(id), ResourceEntry::Data(_)) => Some(*id as LANGID),
                    _ => None,
                })
            }
        }
    }

    /// Find resource data by type, name and language.
    /// See [`ResourceDirectory::resolve_language`] for how the language is chosen when none is given.
    pub fn find<T: Borrow<ResourceEntryName>, N: Borrow<ResourceEntryName>>(
        &self, type_: T, name: N, language: Option<LANGID>,
    ) -> Option<&ResourceData> {
        let (type_, name) = (type_.borrow(), name.borrow());
        let language = self.resolve_language(type_, name, language)?;
        self.root
            .get(type_)?
            .as_table()?
            .get(name)?
            .as_table()?
            .get(ResourceEntryName::ID(language as u32))?
            .as_data()
    }

    /// Insert or replace resource data, creating the type and name tables as needed.
    ///
    /// # Returns
    /// Returns the replaced data, or an error if an existing entry on the path is not a table.
    pub fn upsert<T: Borrow<ResourceEntryName>, N: Borrow<ResourceEntryName>>(
        &mut self, type_: T, name: N, language: LANGID, data: Vec<u8>,
    ) -> Result<Option<ResourceData>, ResourceError> {
        let languages = self.root.table_or_insert(type_.borrow())?.table_or_insert(name.borrow())?;
        let language = ResourceEntryName::ID(language as u32);
        match languages.get_mut(&language) {
            Some(ResourceEntry::Data(existing)) => {
                let previous = existing.clone();
                existing.set_data(data);
                Ok(Some(previous))
            }
            Some(ResourceEntry::Table(_)) => {
                Err(ResourceError::InvalidTable(format!("language entry {:?} is a table", language)))
            }
            None => {
                languages.insert(language, ResourceEntry::Data(ResourceData::new(data)));
                Ok(None)
            }
        }
    }

    /// Remove a resource with all its languages.
    /// The type table is removed as well if it becomes empty.
    ///
    /// # Returns
    /// The removed entry.
    pub fn remove<T: Borrow<ResourceEntryName>, N: Borrow<ResourceEntryName>>(
        &mut self, type_: T, name: N,
    ) -> Option<ResourceEntry> {
        let type_ = type_.borrow();
        let table = self.root.get_mut(type_)?.as_table_mut()?;
        let entry = table.remove(name);
        if table.entries.is_empty() {
            self.root.remove(type_);
        }
        entry
    }

    /// Returns the names of all resources of a type.
    pub fn names<T: Borrow<ResourceEntryName>>(&self, type_: T) -> Vec<&ResourceEntryName> {
        self.root
            .get(type_)
            .and_then(ResourceEntry::as_table)
            .map(ResourceTable::entries)
            .unwrap_or_default()
    }
}

struct TableParser<'a> {
    section:         &'a [u8],
    base:            u32,
    virtual_address: u32,
    visited:         BTreeSet<u32>,
}

/// Portable executable resource table.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceTable {
    pub(crate) data:    ResourceDirectoryTable,
    pub(crate) entries: IndexMap<ResourceEntryName, ResourceEntry, RandomState>,
}
impl ResourceTable {
    fn parse(
        parser: &mut TableParser, directory_offset: u32, level: usize,
    ) -> Result<Self, ImageReadError> {
        if !parser.visited.insert(directory_offset) {
            return Err(ImageReadError::InvalidResourceTable(format!(
                "cycle at table offset {:#x}",
                directory_offset
            )));
        }
        let table_offset = parser.base as usize + directory_offset as usize;
        let resource_table = read_at::<ResourceDirectoryTable>(parser.section, table_offset)?;
        trace!("{} {:#x?}", "--".repeat(level + 1), resource_table);

        let mut entries = IndexMap::with_hasher(RandomState::new());

        let count = resource_table.number_of_name_entries as usize
            + resource_table.number_of_id_entries as usize;
        let mut entry_offset = table_offset + TABLE_HEADER_SIZE as usize;
        for _ in 0..count {
            let entry = read_at::<ResourceDirectoryEntry>(parser.section, entry_offset)?;
            trace!("{} {:#x?}", "--".repeat(level + 1), entry);

            let name = ResourceEntryName::parse(
                parser.section,
                parser.base,
                entry.name_offset_or_integer_id,
            )?;
            let is_table = entry.data_entry_or_subdirectory_offset & HIGH_BIT != 0;
            if is_table == (level == LANGUAGE_LEVEL) {
                return Err(ImageReadError::InvalidResourceTable(format!(
                    "unexpected {} at level {} for {:?}",
                    if is_table { "table" } else { "data" },
                    level,
                    name
                )));
            }

            let resource = if is_table {
                ResourceEntry::Table(ResourceTable::parse(
                    parser,
                    entry.data_entry_or_subdirectory_offset ^ HIGH_BIT,
                    level + 1,
                )?)
            } else {
                let description_offset =
                    parser.base as usize + entry.data_entry_or_subdirectory_offset as usize;
                let description = read_at::<ResourceDataEntry>(parser.section, description_offset)?;
                let address = description.data_rva.checked_sub(parser.virtual_address).ok_or_else(
                    || {
                        ImageReadError::InvalidResourceTable(format!(
                            "resource data address {:#x} before section start {:#x}",
                            { description.data_rva },
                            parser.virtual_address
                        ))
                    },
                )?;
                trace!("{} {:#x?} {:#x?}", "--".repeat(level + 1), address, description);
                let data = slice_at(parser.section, address as usize, description.size as usize)
                    .map_err(|e| ImageReadError::InvalidResourceTable(e.0))?;
                ResourceEntry::Data(ResourceData {
                    codepage: description.codepage,
                    reserved: description.reserved,
                    data:     Vec::from(data).into(),
                })
            };
            entries.insert(name, resource);

            entry_offset += TABLE_ENTRY_SIZE as usize;
        }
        Ok(Self {
            data: resource_table,
            entries,
        })
    }

    /// Returns this table followed by all child tables in breadth-first order.
    fn tables(&self) -> Vec<&ResourceTable> {
        let mut tables = Vec::new();
        let mut queue = VecDeque::from([self]);
        while let Some(table) = queue.pop_front() {
            tables.push(table);
            queue.extend(table.entries.values().filter_map(ResourceEntry::as_table));
        }
        tables
    }

    fn build(&self, virtual_address: u32) -> Vec<u8> {
        let tables = self.tables();

        // all offsets are fixed up front: tables, then names, then data descriptions, then data
        let tables_size = self.tables_size();
        let descriptions_offset = tables_size + aligned_to(self.strings_size(), DATA_ALIGNMENT);
        let data_offset = descriptions_offset + self.descriptions_size();

        let mut tables_data = Vec::with_capacity(tables_size as usize);
        let mut strings_data = Vec::new();
        let mut descriptions_data = Vec::new();
        let mut data_data = Vec::new();

        let mut next_table_offset = self.table_size();
        for table in tables {
            let mut header = table.data;
            header.number_of_name_entries =
                table.entries.keys().filter(|name| name.string_size() > 0).count() as u16;
            header.number_of_id_entries = table.entries.len() as u16 - header.number_of_name_entries;
            tables_data.extend_from_slice(header.as_bytes());

            for (name, entry) in &table.entries {
                let name_offset_or_integer_id = match name {
                    ResourceEntryName::ID(id) => *id,
                    ResourceEntryName::Name(data) => {
                        let offset = (tables_size + strings_data.len() as u32) | HIGH_BIT;
                        strings_data.extend_from_slice(data);
                        offset
                    }
                };
                let data_entry_or_subdirectory_offset = match entry {
                    ResourceEntry::Table(child) => {
                        let offset = next_table_offset | HIGH_BIT;
                        next_table_offset += child.table_size();
                        offset
                    }
                    ResourceEntry::Data(data) => {
                        let offset = descriptions_offset + descriptions_data.len() as u32;
                        let description = ResourceDataEntry {
                            data_rva: virtual_address + data_offset + data_data.len() as u32,
                            size:     data.data.len() as u32,
                            codepage: data.codepage,
                            reserved: data.reserved,
                        };
                        descriptions_data.extend_from_slice(description.as_bytes());
                        data_data.extend_from_slice(&data.data);
                        pad_to(&mut data_data, DATA_ALIGNMENT as usize);
                        offset
                    }
                };
                let entry = ResourceDirectoryEntry {
                    name_offset_or_integer_id,
                    data_entry_or_subdirectory_offset,
                };
                tables_data.extend_from_slice(entry.as_bytes());
            }
        }

        let mut data = tables_data;
        data.extend(strings_data);
        pad_to(&mut data, DATA_ALIGNMENT as usize);
        data.extend(descriptions_data);
        data.extend(data_data);
        data
    }

    fn table_size(&self) -> u32 { TABLE_HEADER_SIZE + self.entries.len() as u32 * TABLE_ENTRY_SIZE }

    fn table_or_insert(&mut self, name: &ResourceEntryName) -> Result<&mut ResourceTable, ResourceError> {
        if !self.entries.contains_key(name) {
            self.insert(name, ResourceEntry::Table(ResourceTable::default()));
        }
        match self.entries.get_mut(name) {
            Some(ResourceEntry::Table(table)) => Ok(table),
            _ => Err(ResourceError::InvalidTable(format!("entry {:?} is not a table", name))),
        }
    }

    /// Get a resource entry from the table.
    /// # Returns
    /// The resource entry.
    pub fn get<N: Borrow<ResourceEntryName>>(&self, name: N) -> Option<&ResourceEntry> {
        self.entries.get(name.borrow())
    }

    /// Get a mutable resource entry from the table.
    /// # Returns
    /// The resource entry.
    pub fn get_mut<N: Borrow<ResourceEntryName>>(&mut self, name: N) -> Option<&mut ResourceEntry> {
        self.entries.get_mut(name.borrow())
    }

    /// Insert a resource entry into the table.
    /// If an entry with the given name already exists, it will be replaced.
    /// New entries are sorted in the order the loader expects: names first, then ids, each ascending.
    /// # Returns
    /// The replaced entry.
    pub fn insert<N: Borrow<ResourceEntryName>>(
        &mut self, name: N, entry: ResourceEntry,
    ) -> Option<ResourceEntry> {
        let name = name.borrow();
        let entry = self.entries.insert(name.clone(), entry);
        if entry.is_none() {
            if name.string_size() > 0 {
                self.data.number_of_name_entries += 1;
            } else {
                self.data.number_of_id_entries += 1;
            }
            self.entries.sort_by(|a, _, b, _| a.compare(b));
        }
        entry
    }

    /// Remove a resource entry from the table.
    /// # Returns
    /// The removed entry.
    pub fn remove<N: Borrow<ResourceEntryName>>(&mut self, name: N) -> Option<ResourceEntry> {
        let name = name.borrow();
        if let Some(entry) = self.entries.shift_remove(name) {
            if name.string_size() > 0 {
                self.data.number_of_name_entries -= 1;
            } else {
                self.data.number_of_id_entries -= 1;
            }
            Some(entry)
        } else {
            None
        }
    }

    /// Returns the entries in the table.
    pub fn entries(&self) -> Vec<&ResourceEntryName> { self.entries.keys().collect() }

    /// Returns the complete size of the table, its resources and its children in the resource table.
    pub fn size(&self) -> u32 {
        self.tables_size()
            + aligned_to(self.strings_size(), DATA_ALIGNMENT)
            + self.descriptions_size()
            + self.data_size()
    }

    /// Returns the size of the table and its children in the resource table.
    pub fn tables_size(&self) -> u32 {
        self.entries.values().map(|entry| entry.table_size()).sum::<u32>() + TABLE_HEADER_SIZE
    }

    /// Returns the size of the strings in the entry and its children in the resource table.
    pub fn strings_size(&self) -> u32 {
        self.entries
            .iter()
            .map(|(name, entry)| name.string_size() + entry.strings_size())
            .sum::<u32>()
    }

    /// Returns the size of the descriptions in the tables children in the resource table.
    pub fn descriptions_size(&self) -> u32 {
        self.entries.values().map(|entry| entry.description_size()).sum::<u32>()
    }

    /// Returns the size of the data in in the tables children in the resource table.
    pub fn data_size(&self) -> u32 {
        self.entries.values().map(|entry| entry.data_size()).sum::<u32>()
    }
}

/// Raw resource data.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceData {
    data:     DebugIgnore<Vec<u8>>,
    codepage: u32,
    reserved: u32,
}
impl ResourceData {
    /// Create resource data with the default codepage.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Returns the raw data.
    pub fn data(&self) -> &[u8] { &self.data }

    /// Returns the codepage of the data.
    pub fn codepage(&self) -> u32 { self.codepage }

    /// Set the raw data.
    pub fn set_data(&mut self, data: Vec<u8>) { self.data = data.into(); }

    /// Set the codepage of the data.
    pub fn set_codepage(&mut self, codepage: u32) { self.codepage = codepage; }
}

/// Resource entry in a resource table.
/// This can be either a child table or raw data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResourceEntry {
    Table(ResourceTable),
    Data(ResourceData),
}
impl ResourceEntry {
    /// Returns the child table if the entry is a table.
    pub fn as_table(&self) -> Option<&ResourceTable> {
        match self {
            ResourceEntry::Table(table) => Some(table),
            ResourceEntry::Data(_) => None,
        }
    }

    /// Returns the mutable child table if the entry is a table.
    pub fn as_table_mut(&mut self) -> Option<&mut ResourceTable> {
        match self {
            ResourceEntry::Table(table) => Some(table),
            ResourceEntry::Data(_) => None,
        }
    }

    /// Returns the resource data if the entry is data.
    pub fn as_data(&self) -> Option<&ResourceData> {
        match self {
            ResourceEntry::Table(_) => None,
            ResourceEntry::Data(data) => Some(data),
        }
    }

    /// Returns the size of the table entry and its children in the resource table.
    pub fn table_size(&self) -> u32 {
        match self {
            // entry + sub-table
            ResourceEntry::Table(table) => table.tables_size() + TABLE_ENTRY_SIZE,
            // entry
            ResourceEntry::Data(_) => TABLE_ENTRY_SIZE,
        }
    }

    /// Returns the size of the strings in the entry and its children in the resource table.
    /// This is the size of the resource names of child tables.
    pub fn strings_size(&self) -> u32 {
        match self {
            ResourceEntry::Table(table) => table.strings_size(),
            ResourceEntry::Data(_) => 0,
        }
    }

    /// Returns the size of the descriptions in the entry and its children in the resource table.
    /// This is the size of the resource data description of the entry or child entries.
    pub fn description_size(&self) -> u32 {
        match self {
            ResourceEntry::Table(table) => table.descriptions_size(),
            ResourceEntry::Data(_) => DATA_ENTRY_SIZE,
        }
    }

    /// Returns the size of the data in the entry and its children in the resource table.
    /// This is the size of the aligned resource data of the entry or child entries.
    pub fn data_size(&self) -> u32 {
        match self {
            ResourceEntry::Table(table) => table.data_size(),
            ResourceEntry::Data(data) => aligned_to(data.data.len() as u32, DATA_ALIGNMENT),
        }
    }
}

/// Resource directory entry name.
/// This can either be a raw id or a name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResourceEntryName {
    // raw id
    ID(u32),
    // 2 byte size + data
    Name(Vec<u8>),
}
impl ResourceEntryName {
    fn parse(section: &[u8], offset: u32, id: u32) -> Result<Self, ReadError> {
        if id & HIGH_BIT != 0 {
            trace!("reading resource name {:#x?}", id);
            let address = offset as usize + (id ^ HIGH_BIT) as usize;
            let length = read_at::<u16>(section, address)? as usize;
            // size is in 16 bit characters so it needs to be doubled
            let data = slice_at(section, address, 2 + length * 2)?;
            trace!("resource name: {:x?}", data);
            Ok(Self::Name(data.to_vec()))
        } else {
            Ok(Self::ID(id))
        }
    }

    pub fn from_string<S: AsRef<str>>(string: S) -> Self {
        let units = encode_u16(string);
        let mut data = Vec::with_capacity(units.len() + 2);
        data.extend_from_slice(&((units.len() / 2) as u16).to_le_bytes());
        data.extend(units);
        Self::Name(data)
    }

    pub fn to_string(&self) -> Option<String> {
        match self {
            Self::ID(_) => None,
            Self::Name(data) => Some(decode_u16(data.get(2..).unwrap_or_default())),
        }
    }

    /// Compare names in resource table order: names before ids, names case-insensitively.
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::ID(a), Self::ID(b)) => a.cmp(b),
            (Self::Name(_), Self::ID(_)) => Ordering::Less,
            (Self::ID(_), Self::Name(_)) => Ordering::Greater,
            (Self::Name(a), Self::Name(b)) => {
                let upper = |data: &[u8]| {
                    decode_u16(data.get(2..).unwrap_or_default()).to_uppercase()
                };
                upper(a).encode_utf16().cmp(upper(b).encode_utf16())
            }
        }
    }

    fn string_size(&self) -> u32 {
        match self {
            Self::ID(_) => 0,
            Self::Name(name) => name.len() as u32,
        }
    }
}
impl From<WORD> for ResourceEntryName {
    fn from(id: WORD) -> Self { Self::ID(id as u32) }
}
