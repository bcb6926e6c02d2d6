//! **R**esource **c**ompiler-style **stamp**ing for portable executables.
//!
//! Supports:
//! * Parsing and introspection of portable executable resources
//! * Setting version strings and numeric file and product versions
//! * Icon replacement
//! * Reading and writing string table entries
//!
//! See [`ResourceUpdater`] for loading, modifying and committing an image file,
//! and [`Image`] for working with an image in memory.
//!
//! # Examples
//!
//! ### Version stamping
//! ```ignore
//! use rcstamp::ResourceUpdater;
//!
//! let mut updater = ResourceUpdater::load(BINARY_PATH)?;
//!
//! updater.set_file_version([2, 0, 1, 0])?;
//! updater.set_version_string("CompanyName", "Acme")?;
//! updater.set_icon(ICON_PATH)?;
//!
//! // write the modified image back to its file
//! updater.commit()?;
//! ```
//!
//! ### In-memory modification
//! ```ignore
//! use rcstamp::Image;
//!
//! let data = std::fs::read(BINARY_PATH)?;
//! let mut image = Image::parse(&data)?;
//!
//! let mut resources = image.resource_directory().cloned().unwrap_or_default();
//! resources.set_resource_string(100, "Hello")?;
//! image.set_resource_directory(resources)?;
//!
//! let target = image.data();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

extern crate alloc;

pub(crate) mod errors;
pub(crate) mod icon;
pub(crate) mod image;
pub(crate) mod resource;
pub(crate) mod string_table;
#[cfg(feature = "std")]
pub(crate) mod updater;
pub(crate) mod util;
pub(crate) mod version;

pub mod constants;
pub mod types;

#[cfg(feature = "std")]
pub use crate::updater::*;
pub use crate::{
    errors::*,
    icon::*,
    image::*,
    resource::*,
    string_table::*,
    util::parse_version_string,
    version::*,
};
