/*!
Module with basic types used in rawdump.

This module contains the GUID type used by partition tables and vendor sections,
and it exposes different size helpers.
*/

pub mod size;

pub mod guid;
#[doc(hidden)]
pub use guid::Guid;
