//! Portable executable headers, sections and resource section rewriting.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format> for more information.

use alloc::{borrow::Cow, format, string::ToString, vec::Vec};
use core::mem::size_of;

use ahash::RandomState;
use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};
use zerocopy::IntoBytes;

use crate::{constants::*, errors::*, resource::*, types::*, util::*};

const SECTION_HEADER_SIZE: u64 = size_of::<SectionHeader>() as u64;
const DATA_DIRECTORY_SIZE: u64 = size_of::<ImageDataDirectory>() as u64;
const NEW_SECTION_NAME: &str = ".rsrc2";

/// Data directory entries of the optional header, in table order.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DataDirectoryType {
    ExportTable,
    ImportTable,
    ResourceTable,
    ExceptionTable,
    CertificateTable,
    BaseRelocationTable,
    Debug,
    Architecture,
    GlobalPtr,
    TLSTable,
    LoadConfigTable,
    BoundImport,
    IAT,
    DelayImportDescriptor,
    CLRRuntimeHeader,
    Reserved,
}

impl DataDirectoryType {
    const ALL: [DataDirectoryType; 16] = {
        use DataDirectoryType::*;
        [
            ExportTable,
            ImportTable,
            ResourceTable,
            ExceptionTable,
            CertificateTable,
            BaseRelocationTable,
            Debug,
            Architecture,
            GlobalPtr,
            TLSTable,
            LoadConfigTable,
            BoundImport,
            IAT,
            DelayImportDescriptor,
            CLRRuntimeHeader,
            Reserved,
        ]
    };
}

/// Where a rebuilt resource directory is placed in the image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Placement {
    /// Overwrite the existing resource section, keeping its size.
    InPlace(usize),
    /// Resize the existing resource section, which is the last section of the image.
    Resize(usize),
    /// Append a new section after all other sections.
    NewSection,
}

/// Parsed portable executable image.
///
/// Holds the raw image data together with its parsed headers and resource directory.
/// Replacing the resource directory with [`Image::set_resource_directory`] rebuilds the raw data.
#[derive(Debug, Clone)]
pub struct Image<'a> {
    pub(crate) image: Cow<'a, [u8]>,

    pub(crate) pe_dos_magic:          u16,
    pub(crate) pe_signature:          u32,
    pub(crate) coff_header:           CoffHeader,
    pub(crate) standard_header:       StandardHeader,
    pub(crate) windows_header:        GenericWindowsHeader,
    pub(crate) header_data_directory: IndexMap<DataDirectoryType, ImageDataDirectory, RandomState>,
    pub(crate) section_table:         Vec<SectionHeader>,

    pub(crate) resource_directory: Option<ResourceDirectory>,

    coff_header_offset:        u64,
    windows_header_offset:     u64,
    optional_header_dd_offset: u64,
    section_table_offset:      u64,
    directories_offset:        u64,
}

impl PartialEq for Image<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.pe_dos_magic == other.pe_dos_magic
            && self.pe_signature == other.pe_signature
            && self.coff_header == other.coff_header
            && self.standard_header == other.standard_header
            && self.windows_header == other.windows_header
            && self.header_data_directory == other.header_data_directory
            && self.section_table == other.section_table
            && self.resource_directory == other.resource_directory
    }
}
impl Eq for Image<'_> {}

impl<'a> Image<'a> {
    /// Parse an image from its raw data.
    ///
    /// # Returns
    /// Returns an error if the headers are invalid or truncated or the resource directory is malformed.
    pub fn parse<R: Into<Cow<'a, [u8]>>>(image: R) -> Result<Self, ImageReadError> {
        let image = image.into();

        let pe_dos_magic = read_at::<u16>(&image, 0)?;
        debug!("dos magic: {:#06x}", pe_dos_magic);
        if pe_dos_magic != PE_DOS_MAGIC {
            return Err(ImageReadError::InvalidHeader("missing MZ signature".into()));
        }

        let pe_signature_offset = read_at::<u32>(&image, PE_PTR_OFFSET as usize)?;
        debug!("e_lfanew: {:#x}", pe_signature_offset);

        let pe_signature = read_at::<u32>(&image, pe_signature_offset as usize)?;
        debug!("nt signature: {:#010x}", pe_signature);
        if pe_signature != PE_NT_SIGNATURE {
            return Err(ImageReadError::InvalidHeader("missing PE signature".into()));
        }

        let coff_header_offset = pe_signature_offset as u64 + 4;
        let coff_header = read_at::<CoffHeader>(&image, coff_header_offset as usize)?;
        debug!("coff header at {:#x}: {:#x?}", coff_header_offset, coff_header);
        if coff_header.size_of_optional_header < 24 {
            return Err(ImageReadError::InvalidHeader("optional header shorter than its standard fields".into()));
        }

        let standard_header_offset = coff_header_offset + 20;
        let standard_header = read_at::<StandardHeader>(&image, standard_header_offset as usize)?;
        debug!("standard header at {:#x}: {:#x?}", standard_header_offset, standard_header);

        let (windows_header_offset, windows_header, optional_header_dd_offset) = {
            if standard_header.magic == PE_32_MAGIC && coff_header.size_of_optional_header >= 96 {
                let windows_header_offset = standard_header_offset + 28;
                let windows_header =
                    read_at::<WindowsHeader<u32>>(&image, windows_header_offset as usize)?;
                (
                    windows_header_offset,
                    GenericWindowsHeader::WindowsHeader32(windows_header),
                    standard_header_offset + 96,
                )
            } else if standard_header.magic == PE_64_MAGIC
                && coff_header.size_of_optional_header >= 112
            {
                let windows_header_offset = standard_header_offset + 24;
                let windows_header =
                    read_at::<WindowsHeader<u64>>(&image, windows_header_offset as usize)?;
                (
                    windows_header_offset,
                    GenericWindowsHeader::WindowsHeader64(windows_header),
                    standard_header_offset + 112,
                )
            } else {
                return Err(ImageReadError::InvalidHeader("unknown optional header magic or size".into()));
            }
        };
        debug!("windows header at {:#x}: {:#x?}", windows_header_offset, windows_header);

        let section_table_offset =
            standard_header_offset + coff_header.size_of_optional_header as u64;
        let directories_offset =
            section_table_offset + coff_header.number_of_sections as u64 * SECTION_HEADER_SIZE;
        if image.len() as u64 <= directories_offset {
            return Err(ImageReadError::InvalidHeader("image truncated in section table".into()));
        }

        // data directories beyond the optional header size are ignored
        let number_of_rva_and_sizes = (windows_header.number_of_rva_and_sizes() as u64)
            .min((section_table_offset - optional_header_dd_offset) / DATA_DIRECTORY_SIZE)
            .min(16);
        debug!("{} data directories at {:#x}", number_of_rva_and_sizes, optional_header_dd_offset);
        let mut header_data_directory = IndexMap::with_hasher(RandomState::new());
        for (index, &kind) in
            DataDirectoryType::ALL.iter().take(number_of_rva_and_sizes as usize).enumerate()
        {
            let offset = optional_header_dd_offset + index as u64 * DATA_DIRECTORY_SIZE;
            let entry = read_at::<ImageDataDirectory>(&image, offset as usize)?;
            trace!("{:?} at {:#x}: {:#x?}", kind, offset, entry);
            header_data_directory.insert(kind, entry);
        }

        let mut section_table = Vec::new();
        for index in 0..coff_header.number_of_sections as u64 {
            let section_header_offset = section_table_offset + index * SECTION_HEADER_SIZE;
            let section_header = read_at::<SectionHeader>(&image, section_header_offset as usize)?;
            trace!(
                "section {} at {:#x}: {:#x?}",
                section_header.name().unwrap_or("?".to_string()),
                section_header_offset,
                section_header
            );
            section_table.push(section_header);
        }

        let mut resource_directory = None;
        if let Some(resource_data) = header_data_directory.get(&DataDirectoryType::ResourceTable) {
            if resource_data.virtual_address > 0 && resource_data.size > 0 {
                let section = section_table
                    .iter()
                    .find(|section| section.contains_rva(resource_data.virtual_address))
                    .ok_or_else(|| {
                        ImageReadError::InvalidSection(format!(
                            "resource directory at {:#x} outside all sections",
                            { resource_data.virtual_address }
                        ))
                    })?;
                debug!(
                    "resource directory at {:#x} in section {}",
                    { resource_data.virtual_address },
                    section.name().unwrap_or("?".to_string())
                );
                let section_data = section_data(&image, section)?;
                resource_directory = Some(ResourceDirectory::parse(
                    section_data,
                    resource_data.virtual_address - section.virtual_address,
                    section.virtual_address,
                )?);
            }
        }

        Ok(Self {
            image,
            pe_dos_magic,
            pe_signature,
            coff_header,
            standard_header,
            windows_header,
            header_data_directory,
            section_table,
            resource_directory,
            coff_header_offset,
            windows_header_offset,
            optional_header_dd_offset,
            section_table_offset,
            directories_offset,
        })
    }

    #[cfg(feature = "std")]
    /// Read and parse an image file.
    ///
    /// # Returns
    /// Returns an error if the file could not be read or [`Image::parse`] fails.
    pub fn parse_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ImageReadError> {
        let data = std::fs::read(path)?;
        Self::parse(data)
    }

    #[cfg(feature = "std")]
    /// Write the raw image data to a writer.
    pub fn write_writer<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ImageWriteError> {
        Ok(writer.write_all(&self.image)?)
    }

    /// Replace the resource directory of the image and rebuild the raw image data.
    ///
    /// A section that starts with the resource directory and holds no other data directory is reused if either:
    /// - The new directory fits into the raw data and the reserved address range of the section.
    /// - The section is the last section in the file and in the address space, in which case it is resized.
    ///
    /// Otherwise a new `.rsrc2` section is appended after the last section and the old section is left as is.
    /// Section sizes are aligned to the file and section alignment of the image.
    /// Data at the end of the image is moved along, and a certificate table pointing to it is adjusted.
    ///
    /// # Returns
    /// The previous resource directory. Fails when a new section header does not fit before the first section,
    /// a section points past the end of the image, the alignments are not powers of two,
    /// or the resource section would exceed the 32-bit address space.
    ///
    /// The image is left unchanged if an error is returned.
    ///
    /// Packed images that unpack their own resources may not run after this.
    pub fn set_resource_directory(
        &mut self, mut resource_directory: ResourceDirectory,
    ) -> Result<Option<ResourceDirectory>, ImageWriteError> {
        let file_alignment = self.windows_header.file_alignment();
        let section_alignment = self.windows_header.section_alignment();
        if !file_alignment.is_power_of_two() || !section_alignment.is_power_of_two() {
            error!("invalid alignment: file {:#x}, section {:#x}", file_alignment, section_alignment);
            return Err(ImageWriteError::InvalidAlignment(file_alignment, section_alignment));
        }

        // all changes go to copies until the new image is assembled
        let mut coff_header = self.coff_header;
        let mut windows_header = self.windows_header;
        let mut header_data_directory = self.header_data_directory.clone();
        let mut section_table = self.section_table.clone();

        let mut required_header_space = 0;

        // ensure that the data directory entry for the resource table exists
        let previous_data_directories = header_data_directory.len() as u64;
        use DataDirectoryType::*;
        for &kind in DataDirectoryType::ALL[..=ResourceTable as usize].iter() {
            if !header_data_directory.contains_key(&kind) {
                debug!("adding empty {:?} data directory", kind);
                header_data_directory.insert(kind, ImageDataDirectory::default());
                required_header_space += DATA_DIRECTORY_SIZE;
            }
        }
        coff_header.size_of_optional_header += required_header_space as u16;
        let old_resource_data_directory = header_data_directory[&ResourceTable];

        let new_resource_directory_size = resource_directory.size();
        debug!("new resource data size: {:#x?}", new_resource_directory_size);

        let first_section_start = section_table
            .iter()
            .filter(|section_header| section_header.size_of_raw_data > 0)
            .map(|section_header| section_header.pointer_to_raw_data as u64)
            .min()
            .unwrap_or(self.image.len() as u64);
        let last_section_end = section_table
            .iter()
            .filter(|section_header| section_header.size_of_raw_data > 0)
            .map(SectionHeader::raw_end)
            .max()
            .unwrap_or(self.image.len() as u64);
        if last_section_end > self.image.len() as u64 {
            return Err(ImageWriteError::InvalidSectionRange(
                last_section_end,
                self.image.len() as u64,
            ));
        }
        if first_section_start < self.directories_offset {
            error!(
                "section data at {:#x} overlaps the headers ending at {:#x}",
                first_section_start, self.directories_offset
            );
            return Err(ImageWriteError::NotEnoughSpaceInHeader);
        }

        let placement = self.resource_placement(
            &section_table,
            &old_resource_data_directory,
            new_resource_directory_size,
            last_section_end,
        );
        debug!("resource directory placement: {:?}", placement);

        let mut resource_section_data;
        let mut new_section_start = last_section_end;
        let mut resource_dd = old_resource_data_directory;
        resource_dd.size = new_resource_directory_size;
        match placement {
            Placement::InPlace(index) => {
                let section = &mut section_table[index];
                resource_section_data = resource_directory.build(section.virtual_address);
                resource_section_data.resize(section.size_of_raw_data as usize, 0);
                section.virtual_size = section.virtual_size.max(new_resource_directory_size);
            }
            Placement::Resize(index) => {
                let section = &mut section_table[index];
                if section.pointer_to_raw_data % file_alignment != 0 {
                    return Err(ImageWriteError::InvalidAlignment(file_alignment, section_alignment));
                }
                resource_section_data = resource_directory.build(section.virtual_address);
                let raw_size = aligned_to(new_resource_directory_size, file_alignment);
                resource_section_data.resize(raw_size as usize, 0);
                section.size_of_raw_data = raw_size;
                section.virtual_size = aligned_to(new_resource_directory_size, section_alignment);
            }
            Placement::NewSection => {
                let virtual_address = section_table
                    .iter()
                    .map(SectionHeader::virtual_end)
                    .max()
                    .unwrap_or(section_alignment as u64);
                let virtual_address = aligned_to(virtual_address, section_alignment as u64);
                new_section_start = aligned_to(last_section_end, file_alignment as u64);
                let raw_size = aligned_to(new_resource_directory_size, file_alignment);
                let virtual_size = aligned_to(new_resource_directory_size, section_alignment);
                if virtual_address + virtual_size as u64 > u32::MAX as u64
                    || new_section_start + raw_size as u64 > u32::MAX as u64
                {
                    return Err(ImageWriteError::AddressOverflow);
                }

                resource_dd.virtual_address = virtual_address as u32;
                resource_section_data = resource_directory.build(virtual_address as u32);
                resource_section_data.resize(raw_size as usize, 0);
                section_table.push(SectionHeader {
                    name: SectionHeader::from_name(NEW_SECTION_NAME),
                    virtual_size,
                    virtual_address: virtual_address as u32,
                    size_of_raw_data: raw_size,
                    pointer_to_raw_data: new_section_start as u32,
                    characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
                    ..SectionHeader::default()
                });
                coff_header.number_of_sections += 1;
                required_header_space += SECTION_HEADER_SIZE;
            }
        }
        resource_directory.virtual_address = resource_dd.virtual_address;
        header_data_directory.insert(ResourceTable, resource_dd);

        let size_of_image = section_table
            .iter()
            .map(SectionHeader::virtual_end)
            .max()
            .map(|end| aligned_to(end, section_alignment as u64))
            .unwrap_or(windows_header.size_of_image() as u64);
        if size_of_image > u32::MAX as u64 {
            return Err(ImageWriteError::AddressOverflow);
        }

        let available_space = first_section_start.saturating_sub(self.directories_offset);
        debug!(
            "header space: {:#x} needed, {:#x} free between {:#x} and {:#x}",
            required_header_space, available_space, self.directories_offset, first_section_start
        );
        if required_header_space > available_space {
            error!(
                "headers need {:#x} more bytes but only {:#x} are free before the first section",
                required_header_space, available_space
            );
            return Err(ImageWriteError::NotEnoughSpaceInHeader);
        }
        let headers_end = self.directories_offset + required_header_space;
        let size_of_headers = (windows_header.size_of_headers() as u64)
            .max(aligned_to(headers_end, file_alignment as u64))
            .min(first_section_start) as u32;

        // data past the last section, such as a certificate table, is moved along
        let new_last_section_end = match placement {
            Placement::InPlace(_) => last_section_end,
            Placement::Resize(index) => section_table[index].raw_end(),
            Placement::NewSection => new_section_start + resource_section_data.len() as u64,
        };
        if let Some(certificate) = header_data_directory.get_mut(&CertificateTable) {
            if certificate.size > 0 {
                warn!("image is signed, modifying resources invalidates the signature");
                if certificate.virtual_address as u64 >= last_section_end {
                    let address =
                        certificate.virtual_address as u64 + new_last_section_end - last_section_end;
                    certificate.virtual_address = u32::try_from(address)
                        .map_err(|_| ImageWriteError::AddressOverflow)?;
                }
            }
        }

        match windows_header {
            GenericWindowsHeader::WindowsHeader32(ref mut header) => {
                header.number_of_rva_and_sizes = header_data_directory.len() as u32;
                header.size_of_image = size_of_image as u32;
                header.size_of_headers = size_of_headers;
                header.check_sum = 0;
            }
            GenericWindowsHeader::WindowsHeader64(ref mut header) => {
                header.number_of_rva_and_sizes = header_data_directory.len() as u32;
                header.size_of_image = size_of_image as u32;
                header.size_of_headers = size_of_headers;
                header.check_sum = 0;
            }
        }

        let image = &self.image;
        let mut new_image = Vec::with_capacity(image.len() + resource_section_data.len());
        new_image.extend_from_slice(&image[..self.coff_header_offset as usize]);
        new_image.extend_from_slice(coff_header.as_bytes());
        // standard header and base of data are copied as is
        new_image
            .extend_from_slice(&image[self.coff_header_offset as usize + 20..self.windows_header_offset as usize]);
        new_image.extend_from_slice(windows_header.as_bytes());
        for (_, data) in header_data_directory.iter() {
            new_image.extend_from_slice(data.as_bytes());
        }
        let data_directories_end =
            self.optional_header_dd_offset + previous_data_directories * DATA_DIRECTORY_SIZE;
        new_image.extend_from_slice(
            &image[data_directories_end as usize..self.section_table_offset as usize],
        );
        for section_header in section_table.iter() {
            new_image.extend_from_slice(section_header.as_bytes());
        }
        new_image.extend_from_slice(&image[headers_end as usize..first_section_start as usize]);

        match placement {
            Placement::InPlace(index) | Placement::Resize(index) => {
                let old_section = self.section_table[index];
                new_image.extend_from_slice(
                    &image[first_section_start as usize..old_section.pointer_to_raw_data as usize],
                );
                new_image.extend_from_slice(&resource_section_data);
                if placement == Placement::InPlace(index) {
                    new_image.extend_from_slice(
                        &image[old_section.raw_end() as usize..last_section_end as usize],
                    );
                }
            }
            Placement::NewSection => {
                new_image.extend_from_slice(
                    &image[first_section_start as usize..last_section_end as usize],
                );
                new_image.resize(new_section_start as usize, 0);
                new_image.extend_from_slice(&resource_section_data);
            }
        }
        new_image.extend_from_slice(&image[last_section_end as usize..]);

        let added_data_directories = header_data_directory.len() as u64 - previous_data_directories;
        self.section_table_offset += added_data_directories * DATA_DIRECTORY_SIZE;
        self.directories_offset =
            self.section_table_offset + section_table.len() as u64 * SECTION_HEADER_SIZE;
        self.coff_header = coff_header;
        self.windows_header = windows_header;
        self.header_data_directory = header_data_directory;
        self.section_table = section_table;

        let previous_resource_directory = self.resource_directory.take();
        self.resource_directory = Some(resource_directory);
        self.image = new_image.into();

        Ok(previous_resource_directory)
    }

    fn resource_placement(
        &self, section_table: &[SectionHeader], resource_data: &ImageDataDirectory,
        new_size: u32, last_section_end: u64,
    ) -> Placement {
        if resource_data.size == 0 || resource_data.virtual_address == 0 {
            return Placement::NewSection;
        }
        let Some(index) = section_table
            .iter()
            .position(|section| section.contains_rva(resource_data.virtual_address))
        else {
            return Placement::NewSection;
        };
        let section = &section_table[index];
        debug!("existing resource section: {}", section.name().unwrap_or("?".to_string()));
        if section.virtual_address != resource_data.virtual_address
            || section.size_of_raw_data == 0
        {
            info!("resource directory does not start its section, keeping section intact");
            return Placement::NewSection;
        }
        // the certificate table address is a file offset
        let shared = self.header_data_directory.iter().any(|(header, directory)| {
            *header != DataDirectoryType::ResourceTable
                && *header != DataDirectoryType::CertificateTable
                && directory.size > 0
                && section.contains_rva(directory.virtual_address)
        });
        if shared {
            info!("resource section also used by other data directories, keeping section intact");
            warn!("resource section used by multiple data directories can indicate a packed executable");
            return Placement::NewSection;
        }

        let section_alignment = self.windows_header.section_alignment() as u64;
        let next_virtual_address = section_table
            .iter()
            .map(|other| other.virtual_address as u64)
            .filter(|&address| address > section.virtual_address as u64)
            .min();
        let reserved_virtual_size = next_virtual_address
            .unwrap_or(aligned_to(section.virtual_end(), section_alignment))
            - section.virtual_address as u64;
        if new_size <= section.size_of_raw_data && new_size as u64 <= reserved_virtual_size {
            debug!("rewriting section in place ({:#x} <= {:#x})", new_size, { section.size_of_raw_data });
            return Placement::InPlace(index);
        }
        if section.raw_end() == last_section_end && next_virtual_address.is_none() {
            debug!("resizing last section ({:#x} -> {:#x})", { section.size_of_raw_data }, new_size);
            return Placement::Resize(index);
        }
        debug!("section too small and not last ({:#x} > {:#x})", new_size, { section.size_of_raw_data });
        Placement::NewSection
    }

    /// Returns the resource directory, if the image has one.
    pub fn resource_directory(&self) -> Option<&ResourceDirectory> {
        self.resource_directory.as_ref()
    }

    /// Returns the raw data of the section containing the resource directory,
    /// or `None` if the image does not contain a resource directory.
    pub fn resource_section(&self) -> Option<&[u8]> {
        let section = self.section_header_for_data_directory(DataDirectoryType::ResourceTable)?;
        section_data(&self.image, section).ok()
    }

    /// Returns the raw image data.
    pub fn data(&self) -> &[u8] { &self.image }

    /// Returns the COFF file header.
    pub fn coff_header(&self) -> &CoffHeader { &self.coff_header }

    /// Returns the standard fields of the optional header.
    pub fn standard_header(&self) -> &StandardHeader { &self.standard_header }

    /// Returns the windows specific fields of the optional header.
    pub fn windows_header(&self) -> &GenericWindowsHeader { &self.windows_header }

    /// Returns a data directory entry, or `None` if the optional header does not have it.
    pub fn data_directory(&self, directory: DataDirectoryType) -> Option<&ImageDataDirectory> {
        self.header_data_directory.get(&directory)
    }

    /// Returns the header of the section the data directory points into.
    pub fn section_header_for_data_directory(
        &self, directory: DataDirectoryType,
    ) -> Option<&SectionHeader> {
        let data_directory = self.data_directory(directory)?;
        if data_directory.virtual_address == 0 || data_directory.size == 0 {
            return None;
        }
        self.section_table
            .iter()
            .find(|section| section.contains_rva(data_directory.virtual_address))
    }

    /// Returns the section headers in table order.
    pub fn section_table(&self) -> &Vec<SectionHeader> { &self.section_table }
}

/// Returns the raw data of a section, truncated to the end of the image.
fn section_data<'d>(image: &'d [u8], section: &SectionHeader) -> Result<&'d [u8], ImageReadError> {
    let start = section.pointer_to_raw_data as usize;
    let end = (section.raw_end() as usize).min(image.len());
    image.get(start..end).ok_or_else(|| {
        ImageReadError::InvalidSection(format!(
            "section {} at {:#x} outside image of {:#x} bytes",
            section.name().unwrap_or("?".to_string()),
            start,
            image.len()
        ))
    })
}
