//! On-disk format: binary primitives, header, entry chain and the
//! BitStream payload region.

pub mod bitstream;
pub mod codec;
pub mod entry;
pub mod header;

pub use bitstream::{Ecs, EcsTag};
pub use codec::{BitsParam, NameValue};
pub use entry::{Entry, Operator};
pub use header::Header;
