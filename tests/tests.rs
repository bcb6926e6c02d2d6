use rcstamp::{constants::*, types::*, *};
use std::sync::Once;

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const HEADERS_SIZE: u32 = 0x400;
const TEXT_VA: u32 = 0x1000;
const RSRC_VA: u32 = 0x2000;
const OPTIONAL_HEADER_OFFSET: usize = 0x58;
const FILE_ALIGNMENT_OFFSET: usize = 0x7c;
const CERTIFICATE_SIZE: usize = 0x20;

static INIT_LOGGER: Once = Once::new();
fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::builder()
            .is_test(false)
            .filter_level(log::LevelFilter::Info)
            .format_timestamp(None)
            .format_module_path(false)
            .format_level(true)
            .format_target(false)
            .write_style(env_logger::WriteStyle::Auto)
            .init();
    });
}

#[derive(Debug, Clone, Copy, Default)]
struct Layout {
    pe64:             bool,
    trailing_section: bool,
    certificate:      bool,
}

fn align(value: u32, alignment: u32) -> u32 { value.div_ceil(alignment) * alignment }

fn text_section() -> Vec<u8> { (0..FILE_ALIGNMENT).map(|i| (i % 251) as u8 + 1).collect() }

/// Build a minimal image with a `.text` section, an optional `.rsrc` section at `RSRC_VA`
/// containing the given raw resource directory, and an optional `.data` section after it.
fn build_image(layout: Layout, resources: Option<&[u8]>) -> Vec<u8> {
    let mut sections = vec![(
        ".text",
        TEXT_VA,
        text_section(),
        FILE_ALIGNMENT,
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    )];
    let mut next_virtual_address = RSRC_VA;
    let mut resource_directory = (0, 0);
    if let Some(resources) = resources {
        let size = resources.len() as u32;
        let mut data = resources.to_vec();
        data.resize(align(size, FILE_ALIGNMENT) as usize, 0);
        resource_directory = (RSRC_VA, size);
        sections.push((
            ".rsrc",
            RSRC_VA,
            data,
            size,
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        ));
        next_virtual_address += align(size, SECTION_ALIGNMENT);
    }
    if layout.trailing_section {
        sections.push((
            ".data",
            next_virtual_address,
            vec![0xdd; FILE_ALIGNMENT as usize],
            FILE_ALIGNMENT,
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        ));
        next_virtual_address += SECTION_ALIGNMENT;
    }
    let sections_end = HEADERS_SIZE
        + sections.iter().map(|(_, _, data, _, _)| data.len() as u32).sum::<u32>();

    let mut image = vec![0u8; HEADERS_SIZE as usize];
    image[0..2].copy_from_slice(b"MZ");
    image[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
    image[0x40..0x44].copy_from_slice(b"PE\0\0");

    let optional_header_size: u16 = if layout.pe64 { 240 } else { 224 };
    let mut coff = Vec::new();
    coff.extend(if layout.pe64 { 0x8664u16 } else { 0x14cu16 }.to_le_bytes());
    coff.extend((sections.len() as u16).to_le_bytes());
    coff.extend([0u8; 12]);
    coff.extend(optional_header_size.to_le_bytes());
    coff.extend(if layout.pe64 { 0x22u16 } else { 0x102u16 }.to_le_bytes());
    image[0x44..0x44 + coff.len()].copy_from_slice(&coff);

    let mut optional = Vec::new();
    optional.extend(if layout.pe64 { PE_64_MAGIC } else { PE_32_MAGIC }.to_le_bytes());
    optional.extend([14u8, 0]);
    optional.extend(FILE_ALIGNMENT.to_le_bytes());
    optional.extend(0u32.to_le_bytes());
    optional.extend(0u32.to_le_bytes());
    optional.extend(TEXT_VA.to_le_bytes());
    optional.extend(TEXT_VA.to_le_bytes());
    if layout.pe64 {
        optional.extend(0x1_4000_0000u64.to_le_bytes());
    } else {
        // base of data
        optional.extend(RSRC_VA.to_le_bytes());
        optional.extend(0x40_0000u32.to_le_bytes());
    }
    optional.extend(SECTION_ALIGNMENT.to_le_bytes());
    optional.extend(FILE_ALIGNMENT.to_le_bytes());
    for version in [6u16, 0, 0, 0, 6, 0] {
        optional.extend(version.to_le_bytes());
    }
    optional.extend(0u32.to_le_bytes());
    optional.extend(next_virtual_address.to_le_bytes());
    optional.extend(HEADERS_SIZE.to_le_bytes());
    optional.extend(0x1234_5678u32.to_le_bytes());
    optional.extend(3u16.to_le_bytes());
    optional.extend(0x8160u16.to_le_bytes());
    for value in [0x10_0000u64, 0x1000, 0x10_0000, 0x1000] {
        if layout.pe64 {
            optional.extend(value.to_le_bytes());
        } else {
            optional.extend((value as u32).to_le_bytes());
        }
    }
    optional.extend(0u32.to_le_bytes());
    optional.extend(16u32.to_le_bytes());
    for index in 0..16 {
        let (address, size) = match index {
            2 => resource_directory,
            4 if layout.certificate => (sections_end, CERTIFICATE_SIZE as u32),
            _ => (0, 0),
        };
        optional.extend(address.to_le_bytes());
        optional.extend(size.to_le_bytes());
    }
    assert_eq!(optional.len(), optional_header_size as usize, "optional header size");
    image[OPTIONAL_HEADER_OFFSET..OPTIONAL_HEADER_OFFSET + optional.len()].copy_from_slice(&optional);

    let mut section_offset = OPTIONAL_HEADER_OFFSET + optional.len();
    let mut pointer_to_raw_data = HEADERS_SIZE;
    for (name, virtual_address, data, virtual_size, characteristics) in &sections {
        let mut header = Vec::new();
        header.extend(SectionHeader::from_name(name).to_le_bytes());
        header.extend(virtual_size.to_le_bytes());
        header.extend(virtual_address.to_le_bytes());
        header.extend((data.len() as u32).to_le_bytes());
        header.extend(pointer_to_raw_data.to_le_bytes());
        header.extend([0u8; 12]);
        header.extend(characteristics.to_le_bytes());
        image[section_offset..section_offset + 40].copy_from_slice(&header);
        section_offset += 40;
        pointer_to_raw_data += data.len() as u32;
    }
    for (_, _, data, _, _) in &sections {
        image.extend_from_slice(data);
    }
    if layout.certificate {
        image.extend([0xce; CERTIFICATE_SIZE]);
    }
    image
}

fn build_icon(images: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend(0u16.to_le_bytes());
    data.extend(1u16.to_le_bytes());
    data.extend((images.len() as u16).to_le_bytes());
    let mut offset = 6 + 16 * images.len();
    for (size, image) in images {
        data.extend([*size, *size, 0, 0]);
        data.extend(1u16.to_le_bytes());
        data.extend(32u16.to_le_bytes());
        data.extend((image.len() as u32).to_le_bytes());
        data.extend((offset as u32).to_le_bytes());
        offset += image.len();
    }
    for (_, image) in images {
        data.extend(image);
    }
    data
}

fn sample_icon(count: u8) -> Vec<u8> {
    let images = (0..count)
        .map(|index| (16 * (index + 1), vec![index + 1; 40 + index as usize * 8]))
        .collect::<Vec<_>>();
    build_icon(&images)
}

fn sample_resources() -> ResourceDirectory {
    let mut resources = ResourceDirectory::default();
    let mut version_info = VersionInfo::default();
    version_info.set_file_version([1, 2, 3, 4]);
    version_info.set_string("CompanyName", "Initech").unwrap();
    version_info.set_string("FileDescription", "Sample").unwrap();
    resources.set_version_info(&version_info).unwrap();
    resources
        .upsert(ResourceEntryName::from(RT_MANIFEST), ResourceEntryName::ID(1), 1033, b"<assembly/>".to_vec())
        .unwrap();
    resources
}

fn section_named<'a>(image: &'a Image, name: &str) -> &'a SectionHeader {
    image
        .section_table()
        .iter()
        .find(|section| section.name().as_deref() == Some(name))
        .unwrap()
}

fn section_bytes<'a>(image: &'a Image, name: &str) -> &'a [u8] {
    let section = section_named(image, name);
    let start = section.pointer_to_raw_data as usize;
    &image.data()[start..start + section.size_of_raw_data as usize]
}

#[test]
fn parse_image() {
    init_logger();

    let resources = sample_resources();
    for pe64 in [false, true] {
        let data = build_image(
            Layout {
                pe64,
                ..Default::default()
            },
            Some(&resources.build(RSRC_VA)),
        );
        let image = Image::parse(&data[..]);
        assert!(image.is_ok(), "image successfully parsed");
        let image = image.unwrap();
        assert_eq!(image.windows_header().is_64(), pe64, "image has the expected bitness");
        assert_eq!(
            { image.standard_header().magic },
            if pe64 { PE_64_MAGIC } else { PE_32_MAGIC },
            "optional header magic"
        );

        let directory = image.resource_directory().unwrap();
        assert_eq!(directory.virtual_address(), RSRC_VA, "resource directory address");
        assert_eq!(directory.root(), resources.root(), "parsed resource directory equals source");
        assert_eq!(
            image.resource_section().unwrap().len(),
            FILE_ALIGNMENT as usize,
            "resource section view has the raw section size"
        );
    }
}

#[test]
fn parse_image_without_resources() {
    init_logger();

    let data = build_image(Layout::default(), None);
    let image = Image::parse(&data[..]).unwrap();
    assert!(image.resource_directory().is_none(), "image has no resource directory");
    assert!(image.resource_section().is_none(), "image has no resource section");
}

#[test]
fn reject_invalid_image() {
    init_logger();

    let mut data = build_image(Layout::default(), None);
    data[0x40..0x44].copy_from_slice(b"XX\0\0");
    assert!(
        matches!(Image::parse(&data[..]), Err(ImageReadError::InvalidHeader(_))),
        "image without pe signature is rejected"
    );

    let data = build_image(Layout::default(), None);
    assert!(Image::parse(&data[..0x100]).is_err(), "truncated image is rejected");
    assert!(Image::parse(&data[..0x20]).is_err(), "image truncated in dos header is rejected");
    assert!(Image::parse(&[0u8; 0][..]).is_err(), "empty image is rejected");
}

#[test]
fn reject_resource_directory_cycle() {
    init_logger();

    let mut resources = Vec::new();
    resources.extend([0u8; 12]);
    resources.extend(0u16.to_le_bytes());
    resources.extend(1u16.to_le_bytes());
    resources.extend((RT_RCDATA as u32).to_le_bytes());
    // subdirectory pointing back to the root table
    resources.extend(0x8000_0000u32.to_le_bytes());
    let data = build_image(Layout::default(), Some(&resources));

    assert!(
        matches!(Image::parse(&data[..]), Err(ImageReadError::InvalidResourceTable(_))),
        "cyclic resource directory is rejected"
    );
}

#[test]
fn reject_resource_data_outside_section() {
    init_logger();

    let table = |offset: Option<u32>, id: u32| {
        let mut table = Vec::new();
        table.extend([0u8; 12]);
        table.extend(0u16.to_le_bytes());
        table.extend(1u16.to_le_bytes());
        table.extend(id.to_le_bytes());
        table.extend(offset.map(|offset| offset | 0x8000_0000).unwrap_or(0x48).to_le_bytes());
        table
    };
    let mut resources = Vec::new();
    resources.extend(table(Some(0x18), RT_RCDATA as u32));
    resources.extend(table(Some(0x30), 1));
    resources.extend(table(None, 1033));
    resources.extend((RSRC_VA + 0x58).to_le_bytes());
    resources.extend(0x10000u32.to_le_bytes());
    resources.extend([0u8; 8]);
    let data = build_image(Layout::default(), Some(&resources));

    assert!(
        matches!(Image::parse(&data[..]), Err(ImageReadError::InvalidResourceTable(_))),
        "resource data outside of the section is rejected"
    );

    // data entry at the root level
    let data = build_image(Layout::default(), Some(&table(None, RT_RCDATA as u32)));
    assert!(Image::parse(&data[..]).is_err(), "resource data at the type level is rejected");
}

#[test]
fn build_resource_section() {
    init_logger();

    let resources = sample_resources();
    let data = resources.build(RSRC_VA);
    assert_eq!(data.len(), resources.size() as usize, "built resource size equals computed size");

    let image = build_image(Layout::default(), Some(&data));
    let image = Image::parse(&image[..]).unwrap();
    let rebuilt = image.resource_directory().unwrap().build(RSRC_VA);
    assert_eq!(rebuilt, data, "rebuilt resource directory is identical");
}

#[test]
fn resource_entry_order() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    let type_ = ResourceEntryName::from(RT_RCDATA);
    for name in [
        ResourceEntryName::ID(5),
        ResourceEntryName::from_string("B"),
        ResourceEntryName::ID(1),
        ResourceEntryName::from_string("a"),
    ] {
        resources.upsert(&type_, name, 1033, vec![1, 2, 3]).unwrap();
    }
    let expected = vec![
        ResourceEntryName::from_string("a"),
        ResourceEntryName::from_string("B"),
        ResourceEntryName::ID(1),
        ResourceEntryName::ID(5),
    ];
    assert_eq!(
        resources.names(&type_).into_iter().cloned().collect::<Vec<_>>(),
        expected,
        "named entries come first, followed by ids, each ascending"
    );

    let image = build_image(Layout::default(), Some(&resources.build(RSRC_VA)));
    let image = Image::parse(&image[..]).unwrap();
    let parsed = image.resource_directory().unwrap();
    assert_eq!(
        parsed.names(&type_).into_iter().cloned().collect::<Vec<_>>(),
        expected,
        "entry order survives a build"
    );
    // header of the name table following the root table with a single entry
    let data = resources.build(RSRC_VA);
    assert_eq!(u16::from_le_bytes([data[36], data[37]]), 2, "named entry count");
    assert_eq!(u16::from_le_bytes([data[38], data[39]]), 2, "id entry count");
}

#[test]
fn resource_language_fallback() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    let (type_, name) = (ResourceEntryName::from(RT_RCDATA), ResourceEntryName::ID(1));
    resources.upsert(&type_, &name, 1033, b"en".to_vec()).unwrap();
    resources.upsert(&type_, &name, 1031, b"de".to_vec()).unwrap();

    assert_eq!(
        resources.find(&type_, &name, None).unwrap().data(),
        b"de",
        "first available language is used without a neutral language"
    );
    assert_eq!(
        resources.find(&type_, &name, Some(1033)).unwrap().data(),
        b"en",
        "requested language is used"
    );
    assert!(resources.find(&type_, &name, Some(2052)).is_none(), "missing language is not found");

    resources.upsert(&type_, &name, LANGUAGE_ID_NEUTRAL, b"neutral".to_vec()).unwrap();
    assert_eq!(
        resources.find(&type_, &name, None).unwrap().data(),
        b"neutral",
        "neutral language is preferred"
    );

    assert!(resources.remove(&type_, &name).is_some(), "resource removed");
    assert!(resources.root().get(&type_).is_none(), "empty type table removed");
}

#[test]
fn convert_resource_name_string() {
    init_logger();

    let name = ResourceEntryName::from_string("TEST_NAME");
    assert_eq!(name.to_string(), Some("TEST_NAME".to_string()), "name converted");
    assert_eq!(ResourceEntryName::ID(3).to_string(), None, "id has no name");
}

#[test]
fn parse_version_strings() {
    init_logger();

    assert_eq!(parse_version_string("1"), Some([1, 0, 0, 0]));
    assert_eq!(parse_version_string("1.2"), Some([1, 2, 0, 0]));
    assert_eq!(parse_version_string("1.2.3"), Some([1, 2, 3, 0]));
    assert_eq!(parse_version_string("1.2.3.4"), Some([1, 2, 3, 4]));
    assert_eq!(parse_version_string("65535.0.0.65535"), Some([65535, 0, 0, 65535]));

    for invalid in ["", "1.2.3.4.5", "a", "1.b", "1..2", "1.", "-1", "65536", " 1", "1.2.3.4 "] {
        assert_eq!(parse_version_string(invalid), None, "{:?} is rejected", invalid);
    }
}

#[test]
fn build_version_info() {
    init_logger();

    let mut version_info = VersionInfo::default();
    version_info.set_file_version([2, 0, 1, 0]);
    version_info.set_product_version([3, 4, 5, 6]);
    version_info.set_string("ProductName", "Widget").unwrap();
    version_info.set_string("CompanyName", "Acme").unwrap();
    version_info.set_string("Comments", "").unwrap();
    let german = Translation {
        language: 1031,
        codepage: 1252,
    };
    version_info.translations.push(german);
    let mut strings = VersionStrings::default();
    strings.insert("FileDescription".to_string(), "Werkzeug".to_string());
    version_info.strings.insert(german, strings);

    let data = version_info.build().unwrap();
    assert_eq!(data.len() % 4, 0, "version info is padded");
    assert_eq!(
        u16::from_le_bytes([data[0], data[1]]) as usize,
        data.len(),
        "root length covers the whole resource"
    );

    let parsed = VersionInfo::parse(&data).unwrap();
    assert_eq!(parsed, version_info, "version info round trip");
    assert_eq!(parsed.info.file_version(), [2, 0, 1, 0], "file version");
    assert_eq!(parsed.info.product_version(), [3, 4, 5, 6], "product version");
    assert_eq!(parsed.get_string("CompanyName"), Some("Acme"), "string value");
    assert_eq!(parsed.get_string("FileDescription"), Some("Werkzeug"), "string of second table");
    assert_eq!(parsed.get_string("Comments"), Some(""), "empty string value");
    assert_eq!(
        parsed.translations[0],
        Translation {
            language: LANGUAGE_ID_EN_US,
            codepage: CODE_PAGE_ID_EN_US,
        },
        "default translation created"
    );
}

#[test]
fn set_fixed_versions() {
    init_logger();

    for version in [[0, 0, 0, 0], [1, 2, 3, 4], [65535, 65535, 65535, 65535], [0, 65535, 1, 0]] {
        let mut version_info = VersionInfo::default();
        version_info.set_file_version(version);
        version_info.set_product_version(version);
        let parsed = VersionInfo::parse(&version_info.build().unwrap()).unwrap();
        assert_eq!(parsed.info.file_version(), version, "file version {:?}", version);
        assert_eq!(parsed.info.product_version(), version, "product version {:?}", version);
    }
}

#[test]
fn parse_version_info_with_byte_length_values() {
    init_logger();

    let mut version_info = VersionInfo::default();
    version_info.set_string("CompanyName", "Acme").unwrap();
    let mut data = version_info.build().unwrap();

    let key = "CompanyName\0".encode_utf16().flat_map(|c| c.to_le_bytes()).collect::<Vec<_>>();
    let position = data.windows(key.len()).position(|window| window == key).unwrap();
    // value length in bytes instead of characters
    data[position - 4..position - 2].copy_from_slice(&10u16.to_le_bytes());

    let parsed = VersionInfo::parse(&data).unwrap();
    assert_eq!(parsed.get_string("CompanyName"), Some("Acme"), "value read up to its terminator");
}

#[test]
fn reject_invalid_version_info() {
    init_logger();

    let mut version_info = VersionInfo::default();
    assert!(
        matches!(version_info.set_string("", "value"), Err(ResourceError::EmptyKey)),
        "empty key is rejected"
    );

    let mut data = version_info.build().unwrap();
    let oversized_length = ((data.len() + 4) as u16).to_le_bytes();
    data[0..2].copy_from_slice(&oversized_length);
    assert!(VersionInfo::parse(&data).is_err(), "node exceeding its parent is rejected");

    let mut data = version_info.build().unwrap();
    let signature = VS_FIXEDFILEINFO_SIGNATURE.to_le_bytes();
    let position = data.windows(4).position(|window| window == signature).unwrap();
    data[position] = 0;
    assert!(VersionInfo::parse(&data).is_err(), "invalid fixed file info signature is rejected");
}

#[test]
fn reject_oversized_version_info() {
    init_logger();

    let mut version_info = VersionInfo::default();
    version_info.set_string("CompanyName", "Acme").unwrap();
    let before = version_info.clone();
    assert!(
        matches!(version_info.set_string("Comments", "x".repeat(40_000)), Err(ResourceError::InvalidArgument(_))),
        "value exceeding the node length is rejected"
    );
    assert_eq!(version_info, before, "version info unchanged after rejected value");

    version_info.set_string("Comments", "x".repeat(30_000)).unwrap();
    let data = version_info.build().unwrap();
    assert_eq!(
        u16::from_le_bytes([data[0], data[1]]) as usize,
        data.len(),
        "root length covers a large resource"
    );
    assert_eq!(
        VersionInfo::parse(&data).unwrap().get_string("Comments").map(str::len),
        Some(30_000),
        "large value round trip"
    );

    let (_, strings) = version_info.strings.get_index_mut(0).unwrap();
    strings.insert("Comments".to_string(), "x".repeat(40_000));
    assert!(
        matches!(version_info.build(), Err(ResourceError::InvalidVersionInfo(_))),
        "oversized version info is not built"
    );
}

#[test]
fn set_version_info() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    assert!(resources.get_version_info().unwrap().is_none(), "no version info");

    let mut version_info = VersionInfo::default();
    version_info.set_string("CompanyName", "Acme").unwrap();
    resources.set_version_info(&version_info).unwrap();
    assert_eq!(
        resources.names(ResourceEntryName::from(RT_VERSION)),
        vec![&ResourceEntryName::ID(1)],
        "version info created with id 1"
    );
    assert_eq!(
        resources.resolve_language(ResourceEntryName::from(RT_VERSION), ResourceEntryName::ID(1), None),
        Some(LANGUAGE_ID_EN_US),
        "version info created for en-US"
    );

    // existing version info keeps its language
    let mut resources = ResourceDirectory::default();
    resources
        .upsert(ResourceEntryName::from(RT_VERSION), ResourceEntryName::ID(1), 1031, version_info.build().unwrap())
        .unwrap();
    version_info.set_string("CompanyName", "Globex").unwrap();
    resources.set_version_info(&version_info).unwrap();
    let languages = resources
        .root()
        .get(ResourceEntryName::from(RT_VERSION))
        .and_then(ResourceEntry::as_table)
        .and_then(|table| table.get(ResourceEntryName::ID(1)))
        .and_then(ResourceEntry::as_table)
        .unwrap();
    assert_eq!(languages.entries(), vec![&ResourceEntryName::ID(1031)], "language kept");
    assert_eq!(
        resources.get_version_info().unwrap().unwrap().get_string("CompanyName"),
        Some("Globex"),
        "version string replaced"
    );
}

#[test]
fn change_resource_strings() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    resources.set_resource_string(100, "X").unwrap();
    assert_eq!(resources.get_resource_string(100).unwrap(), "X", "string read back");
    assert_eq!(
        resources.names(ResourceEntryName::from(RT_STRING)),
        vec![&ResourceEntryName::ID(7)],
        "exactly one bundle created"
    );

    let table = resources.get_string_table(6).unwrap();
    for (slot, string) in table.strings().iter().enumerate() {
        if slot == 4 {
            assert_eq!(string, "X", "slot of the string");
        } else {
            assert!(string.is_empty(), "other slots are empty");
        }
    }
    assert_eq!(resources.get_resource_string(96).unwrap(), "", "empty slot in existing bundle");

    resources.set_resource_string(101, "Y ünïcödé").unwrap();
    resources.set_resource_string(100, "Z").unwrap();
    assert_eq!(resources.get_resource_string(100).unwrap(), "Z", "string replaced");
    assert_eq!(resources.get_resource_string(101).unwrap(), "Y ünïcödé", "neighbouring string");

    assert!(
        matches!(resources.get_resource_string(5000), Err(ResourceError::NotFound(_))),
        "missing bundle is not found"
    );
    assert!(
        matches!(resources.set_resource_string(0x10000, "X"), Err(ResourceError::InvalidArgument(_))),
        "string ids are 16 bit"
    );
    assert!(
        matches!(resources.set_resource_string(102, "x".repeat(0x10000)), Err(ResourceError::InvalidArgument(_))),
        "string length is 16 bit"
    );
    assert_eq!(resources.get_resource_string(102).unwrap(), "", "rejected string not stored");
}

#[test]
fn parse_string_table() {
    init_logger();

    let mut data = Vec::new();
    data.extend(3u16.to_le_bytes());
    data.extend("abc".encode_utf16().flat_map(|c| c.to_le_bytes()));
    let table = StringTable::parse(&data).unwrap();
    assert_eq!(table.get(0), Some("abc"), "first string");
    assert_eq!(table.get(1), Some(""), "missing trailing slots are empty");

    data.extend(10u16.to_le_bytes());
    assert!(StringTable::parse(&data).is_err(), "string exceeding the data is rejected");

    let mut table = StringTable::default();
    table.set(15, "last").unwrap();
    let built = table.build();
    assert_eq!(built.len(), 15 * 2 + 2 + 8, "empty slots are stored as zero length");
    assert_eq!(StringTable::parse(&built).unwrap(), table, "string table round trip");
}

#[test]
fn parse_icon_file() {
    init_logger();

    let data = sample_icon(3);
    let icon = IconFile::parse(&data).unwrap();
    assert_eq!(icon.len(), 3, "icon images");

    let (group, images) = icon.build_resources(10).unwrap();
    assert_eq!(group.ids(), vec![10, 11, 12], "image ids");
    assert_eq!(images[1].1, vec![2; 48], "image data");
    assert_eq!(IconGroup::parse(&group.build()).unwrap(), group, "icon group round trip");

    assert!(IconFile::parse(&data[..data.len() - 1]).is_err(), "truncated icon is rejected");
    assert!(IconFile::parse(&build_icon(&[])).is_err(), "empty icon is rejected");
    assert!(IconFile::parse(b"not an icon").is_err(), "invalid icon is rejected");
}

#[test]
fn set_icon() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    // unrelated icon image
    resources
        .upsert(ResourceEntryName::from(RT_ICON), ResourceEntryName::ID(7), 1033, vec![7; 16])
        .unwrap();

    resources.set_icon(&sample_icon(2)).unwrap();
    let group = resources.get_icon_group().unwrap().unwrap();
    assert_eq!(group.ids(), vec![8, 9], "image ids above existing icons");

    resources.set_icon(&sample_icon(3)).unwrap();
    let group = resources.get_icon_group().unwrap().unwrap();
    assert_eq!(group.entries.len(), 3, "one group entry per image");
    assert_eq!(group.ids(), vec![10, 11, 12], "image ids do not collide");
    assert_eq!(
        resources.names(ResourceEntryName::from(RT_GROUP_ICON)),
        vec![&ResourceEntryName::ID(1)],
        "single icon group"
    );
    assert_eq!(
        resources.names(ResourceEntryName::from(RT_ICON)),
        vec![
            &ResourceEntryName::ID(7),
            &ResourceEntryName::ID(10),
            &ResourceEntryName::ID(11),
            &ResourceEntryName::ID(12)
        ],
        "previous group images removed"
    );
    assert_eq!(resources.get_icon_image(12), Some(&[3u8; 56][..]), "image data");

    let before = resources.clone();
    assert!(resources.set_icon(b"\0\0\x01\0\x05\0").is_err(), "invalid icon is rejected");
    assert_eq!(resources, before, "resources unchanged after failure");

    let removed = resources.remove_icon().unwrap().unwrap();
    assert_eq!(removed.ids(), vec![10, 11, 12], "removed group");
    assert!(resources.get_icon_group().unwrap().is_none(), "icon removed");
    assert_eq!(
        resources.names(ResourceEntryName::from(RT_ICON)),
        vec![&ResourceEntryName::ID(7)],
        "only unrelated icon remains"
    );
}

#[test]
fn convert_image_to_icon() {
    init_logger();

    let mut png = std::io::Cursor::new(Vec::new());
    image::RgbaImage::from_pixel(40, 40, image::Rgba([200, 30, 30, 255]))
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();
    let icon = IconFile::from_image(png.get_ref()).unwrap();
    assert_eq!(IconFile::parse(&icon).unwrap().len(), 6, "icon with common sizes");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.exe");
    std::fs::write(&path, build_image(Layout::default(), None)).unwrap();
    let mut updater = ResourceUpdater::load(&path).unwrap();
    updater.set_icon_data(png.get_ref()).unwrap();
    updater.commit().unwrap();

    let updater = ResourceUpdater::load(&path).unwrap();
    let group = updater.resources().get_icon_group().unwrap().unwrap();
    assert_eq!(group.entries.len(), 6, "converted icon images");
}

#[test]
fn set_resource_section_in_place() {
    init_logger();

    for pe64 in [false, true] {
        let layout = Layout {
            pe64,
            trailing_section: true,
            ..Default::default()
        };
        let data = build_image(layout, Some(&sample_resources().build(RSRC_VA)));
        let mut image = Image::parse(&data[..]).unwrap();

        let mut resources = image.resource_directory().cloned().unwrap();
        let mut version_info = resources.get_version_info().unwrap().unwrap();
        version_info.set_string("CompanyName", "Acme").unwrap();
        resources.set_version_info(&version_info).unwrap();
        assert!(resources.size() <= FILE_ALIGNMENT, "resources still fit");
        image.set_resource_directory(resources.clone()).unwrap();

        assert_eq!(image.section_table().len(), 3, "no section added");
        assert_eq!(image.data().len(), data.len(), "image size unchanged");
        assert_eq!({ section_named(&image, ".rsrc").size_of_raw_data }, FILE_ALIGNMENT, "raw size unchanged");
        assert_eq!(section_bytes(&image, ".text"), &text_section()[..], "code unchanged");
        assert_eq!(section_bytes(&image, ".data"), &[0xdd; FILE_ALIGNMENT as usize][..], "data unchanged");
        let resource_table = image.data_directory(DataDirectoryType::ResourceTable).unwrap();
        assert_eq!({ resource_table.size }, resources.size(), "resource directory size");

        let parsed = Image::parse(image.data()).unwrap();
        assert_eq!(parsed, image, "written image parses to the same image");
        assert_eq!(
            parsed.resource_directory().unwrap().get_version_info().unwrap().unwrap().get_string("CompanyName"),
            Some("Acme"),
            "version string stored"
        );
    }
}

#[test]
fn set_resource_section_grow_last() {
    init_logger();

    let data = build_image(
        Layout {
            certificate: true,
            ..Default::default()
        },
        Some(&sample_resources().build(RSRC_VA)),
    );
    let mut image = Image::parse(&data[..]).unwrap();

    let mut resources = image.resource_directory().cloned().unwrap();
    resources
        .upsert(ResourceEntryName::from(RT_RCDATA), ResourceEntryName::ID(1), 1033, vec![0xab; 0x1800])
        .unwrap();
    let size = resources.size();
    image.set_resource_directory(resources).unwrap();

    assert_eq!(image.section_table().len(), 2, "no section added");
    let section = *section_named(&image, ".rsrc");
    assert_eq!({ section.size_of_raw_data }, align(size, FILE_ALIGNMENT), "raw size is file aligned");
    assert_eq!({ section.virtual_size }, align(size, SECTION_ALIGNMENT), "virtual size is section aligned");
    assert_eq!(
        image.windows_header().size_of_image(),
        RSRC_VA + align(size, SECTION_ALIGNMENT),
        "size of image covers the resized section"
    );
    assert_eq!(section_bytes(&image, ".text"), &text_section()[..], "code unchanged");

    let certificate = *image.data_directory(DataDirectoryType::CertificateTable).unwrap();
    let offset = certificate.virtual_address as usize;
    assert_eq!(offset, section.raw_end() as usize, "certificate follows the section");
    assert_eq!(
        &image.data()[offset..offset + CERTIFICATE_SIZE],
        &[0xce; CERTIFICATE_SIZE][..],
        "certificate moved"
    );

    // base of data of the pe32 header is preserved
    let base_of_data = OPTIONAL_HEADER_OFFSET + 24;
    assert_eq!(
        &image.data()[base_of_data..base_of_data + 4],
        &RSRC_VA.to_le_bytes()[..],
        "base of data preserved"
    );
    let checksum = OPTIONAL_HEADER_OFFSET + 64;
    assert_eq!(&image.data()[checksum..checksum + 4], &[0; 4][..], "checksum reset");

    let parsed = Image::parse(image.data()).unwrap();
    assert_eq!(parsed, image, "written image parses to the same image");
}

#[test]
fn set_resource_section_new_section() {
    init_logger();

    for pe64 in [false, true] {
        let layout = Layout {
            pe64,
            trailing_section: true,
            ..Default::default()
        };
        let original = sample_resources().build(RSRC_VA);
        let data = build_image(layout, Some(&original));
        let mut image = Image::parse(&data[..]).unwrap();

        let mut resources = image.resource_directory().cloned().unwrap();
        resources
            .upsert(ResourceEntryName::from(RT_RCDATA), ResourceEntryName::ID(1), 1033, vec![0xab; 0x1800])
            .unwrap();
        let size = resources.size();
        image.set_resource_directory(resources).unwrap();

        assert_eq!(image.section_table().len(), 4, "section added");
        assert_eq!({ image.coff_header().number_of_sections }, 4, "section count");
        let section = *section_named(&image, ".rsrc2");
        assert_eq!({ section.virtual_address }, 0x4000, "new section follows the last section");
        assert_eq!(section.pointer_to_raw_data % FILE_ALIGNMENT, 0, "raw data is file aligned");
        assert_eq!({ section.size_of_raw_data }, align(size, FILE_ALIGNMENT), "raw size is file aligned");
        assert_eq!(image.windows_header().size_of_image(), 0x4000 + align(size, SECTION_ALIGNMENT), "size of image");

        let resource_table = image.data_directory(DataDirectoryType::ResourceTable).unwrap();
        assert_eq!({ resource_table.virtual_address }, 0x4000, "resource directory moved");
        assert_eq!(section_bytes(&image, ".text"), &text_section()[..], "code unchanged");
        assert_eq!(section_bytes(&image, ".data"), &[0xdd; FILE_ALIGNMENT as usize][..], "data unchanged");
        assert_eq!(&section_bytes(&image, ".rsrc")[..original.len()], &original[..], "old section intact");

        let parsed = Image::parse(image.data()).unwrap();
        assert_eq!(parsed, image, "written image parses to the same image");
        assert_eq!(
            parsed.resource_directory().unwrap().get_version_info().unwrap().unwrap().get_string("CompanyName"),
            Some("Initech"),
            "existing resources carried over"
        );
    }
}

#[test]
fn set_resource_section_without_resources() {
    init_logger();

    let data = build_image(Layout::default(), None);
    let mut image = Image::parse(&data[..]).unwrap();

    let mut resources = ResourceDirectory::default();
    resources.set_resource_string(1, "created").unwrap();
    let previous = image.set_resource_directory(resources).unwrap();
    assert!(previous.is_none(), "no previous resource directory");

    assert_eq!(image.section_table().len(), 2, "section added");
    section_named(&image, ".rsrc2");
    let parsed = Image::parse(image.data()).unwrap();
    assert_eq!(
        parsed.resource_directory().unwrap().get_resource_string(1).unwrap(),
        "created",
        "resources stored"
    );
}

#[test]
fn reject_invalid_alignment() {
    init_logger();

    let mut data = build_image(Layout::default(), None);
    data[FILE_ALIGNMENT_OFFSET..FILE_ALIGNMENT_OFFSET + 4].copy_from_slice(&0x300u32.to_le_bytes());
    let mut image = Image::parse(&data[..]).unwrap();
    let before = image.clone();

    let mut resources = ResourceDirectory::default();
    resources.set_resource_string(1, "created").unwrap();
    assert!(
        matches!(image.set_resource_directory(resources), Err(ImageWriteError::InvalidAlignment(..))),
        "invalid file alignment is rejected"
    );
    assert_eq!(image.data(), before.data(), "image unchanged after failure");
}

#[test]
fn reject_sections_overlapping_headers() {
    init_logger();

    let mut data = build_image(Layout::default(), Some(&sample_resources().build(RSRC_VA)));
    // pointer to raw data of the first section, inside the section table
    let pointer_offset = OPTIONAL_HEADER_OFFSET + 224 + 20;
    data[pointer_offset..pointer_offset + 4].copy_from_slice(&0x100u32.to_le_bytes());
    let mut image = Image::parse(&data[..]).unwrap();
    let before = image.clone();

    let mut resources = image.resource_directory().cloned().unwrap();
    resources.set_resource_string(1, "created").unwrap();
    assert!(
        matches!(image.set_resource_directory(resources), Err(ImageWriteError::NotEnoughSpaceInHeader)),
        "section data overlapping the headers is rejected"
    );
    assert_eq!(image.data(), before.data(), "image unchanged after failure");
}

#[test]
fn update_file() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.exe");
    std::fs::write(&path, build_image(Layout::default(), None)).unwrap();

    let mut updater = ResourceUpdater::load(&path).unwrap();
    updater.set_file_version(parse_version_string("2.0.1.0").unwrap()).unwrap();
    updater.set_product_version(parse_version_string("2.0.1.0").unwrap()).unwrap();
    updater.set_version_string("CompanyName", "Acme").unwrap();
    updater.set_icon_data(&sample_icon(2)).unwrap();
    updater.change_string(42, "answer").unwrap();
    updater.commit().unwrap();

    let updater = ResourceUpdater::load(&path).unwrap();
    let version_info = updater.version_info().unwrap().unwrap();
    assert_eq!(version_info.info.file_version(), [2, 0, 1, 0], "file version");
    assert_eq!(version_info.info.product_version(), [2, 0, 1, 0], "product version");
    assert_eq!(updater.get_version_string("CompanyName").unwrap(), "Acme", "company name");
    assert_eq!(updater.get_string(42).unwrap(), "answer", "string table entry");
    assert_eq!(
        updater.resources().get_icon_group().unwrap().unwrap().entries.len(),
        2,
        "icon images"
    );
    assert_eq!(section_bytes(updater.image(), ".text"), &text_section()[..], "code unchanged");
    assert_eq!(
        u32::from_le_bytes(updater.image().data()[0x3c..0x40].try_into().unwrap()),
        0x40,
        "dos header unchanged"
    );

    assert_eq!(
        updater.get_version_string("LegalCopyright").map_err(|error| error.kind()).err(),
        Some(ErrorKind::NotFound),
        "missing version string is not found"
    );
    assert_eq!(
        updater.get_string(5000).map_err(|error| error.kind()).err(),
        Some(ErrorKind::NotFound),
        "missing string bundle is not found"
    );
}

#[test]
fn commit_is_idempotent() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();
    for (index, layout) in [
        Layout::default(),
        Layout {
            pe64: true,
            trailing_section: true,
            certificate: true,
        },
    ]
    .into_iter()
    .enumerate()
    {
        let path = dir.path().join(format!("target{}.exe", index));
        std::fs::write(&path, build_image(layout, Some(&sample_resources().build(RSRC_VA)))).unwrap();

        let mut updater = ResourceUpdater::load(&path).unwrap();
        updater.set_version_string("FileDescription", "a much longer description ".repeat(30)).unwrap();
        updater.commit().unwrap();
        let first = std::fs::read(&path).unwrap();
        updater.commit().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second, "second commit writes an identical file");

        let mut updater = ResourceUpdater::load(&path).unwrap();
        updater.commit().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first, "commit after reload writes an identical file");
    }
}

#[test]
fn failed_update_leaves_file_untouched() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("invalid.exe");
    let mut data = build_image(Layout::default(), None);
    data[0x40..0x44].copy_from_slice(b"XX\0\0");
    std::fs::write(&path, &data).unwrap();
    let error = ResourceUpdater::load(&path).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Format, "missing pe signature is a format error");
    assert_eq!(std::fs::read(&path).unwrap(), data, "file untouched");

    let path = dir.path().join("misaligned.exe");
    let mut data = build_image(Layout::default(), None);
    data[FILE_ALIGNMENT_OFFSET..FILE_ALIGNMENT_OFFSET + 4].copy_from_slice(&0x300u32.to_le_bytes());
    std::fs::write(&path, &data).unwrap();
    let mut updater = ResourceUpdater::load(&path).unwrap();
    updater.set_version_string("CompanyName", "Acme").unwrap();
    let error = updater.commit().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Layout, "invalid alignment is a layout error");
    assert_eq!(std::fs::read(&path).unwrap(), data, "file untouched");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2, "no temporary files left");

    let mut updater = ResourceUpdater::load(&path).unwrap();
    let error = updater.set_icon(dir.path().join("missing.ico")).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::IO, "missing icon file is an io error");
    let error = updater.set_version_string("", "value").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument, "empty key is an invalid argument");
    let error = updater.set_version_string("Comments", "x".repeat(40_000)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument, "oversized version string is an invalid argument");
    let error = updater.change_string(0x10000, "X").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument, "string id above 16 bits is an invalid argument");

    let error = ResourceUpdater::load(dir.path().join("missing.exe")).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::IO, "missing file is an io error");
}
