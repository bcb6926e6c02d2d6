use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::{
    any::type_name,
    ops::{Add, Rem, Sub},
};

use zerocopy::FromBytes;

use crate::ReadError;

pub fn read<T: FromBytes + Copy>(resource: &[u8]) -> Result<T, ReadError> {
    T::read_from_prefix(resource)
        .map_err(|_| ReadError(type_name::<T>().to_string()))
        .map(|(value, _)| value)
}

pub fn read_at<T: FromBytes + Copy>(resource: &[u8], offset: usize) -> Result<T, ReadError> {
    match resource.get(offset..) {
        Some(data) => read(data),
        None => Err(ReadError(format!(
            "{} at {:#x} outside of {:#x} bytes",
            type_name::<T>(),
            offset,
            resource.len()
        ))),
    }
}

pub fn slice_at(resource: &[u8], offset: usize, size: usize) -> Result<&[u8], ReadError> {
    offset
        .checked_add(size)
        .and_then(|end| resource.get(offset..end))
        .ok_or_else(|| {
            ReadError(format!("{:#x} bytes at {:#x} outside of {:#x} bytes", size, offset, resource.len()))
        })
}

pub fn aligned_to<T: Add<Output = T> + Sub<Output = T> + Rem<Output = T> + Eq + Copy + Default>(
    value: T, alignment: T,
) -> T {
    if value % alignment == T::default() {
        return value;
    }
    value + alignment - (value % alignment)
}

pub fn pad_to(data: &mut Vec<u8>, alignment: usize) {
    let len = aligned_to(data.len(), alignment);
    data.resize(len, 0);
}

/// Decode a nul-terminated UTF-16LE string.
/// Reading stops at the first nul character or at the end of the data.
///
/// # Returns
/// The decoded string and the number of bytes consumed including the terminator, if present.
pub fn read_u16_string(data: &[u8]) -> (String, usize) {
    let units = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect::<Vec<_>>();
    let consumed = ((units.len() + 1) * 2).min(data.len() - data.len() % 2);
    let string = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect::<String>();
    (string, consumed)
}

/// Decode UTF-16LE data without terminator.
pub fn decode_u16(data: &[u8]) -> String {
    let units = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
    char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
}

/// Encode a string as UTF-16LE without terminator.
pub fn encode_u16<S: AsRef<str>>(string: S) -> Vec<u8> {
    string.as_ref().encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Encode a string as nul-terminated UTF-16LE.
pub fn string_to_u16<S: AsRef<str>>(string: S) -> Vec<u8> {
    let string = string.as_ref();
    let mut data = Vec::with_capacity(string.len() * 2 + 2);
    data.extend(string.encode_utf16().flat_map(|c| c.to_le_bytes()));
    data.extend([0, 0]);
    data
}

/// Parse a version string of one to four dot-separated 16-bit components.
/// Missing trailing components are set to 0.
///
/// # Returns
/// Returns `None` for empty components, more than four components or components that are not decimal 16-bit integers.
pub fn parse_version_string<S: AsRef<str>>(version: S) -> Option<[u16; 4]> {
    let mut components = [0u16; 4];
    let mut count = 0;
    for part in version.as_ref().split('.') {
        if count == 4 || part.is_empty() || !part.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        components[count] = part.parse().ok()?;
        count += 1;
    }
    Some(components)
}
