//! wxpush protocol - record and packet codecs
//!
//! This crate defines the wire format shared by every transport:
//! - `WeatherRecord`: live and sample records with a field-presence bitmask
//! - `UdpPacket`: self-contained datagrams carrying sequence and auth code
//! - `TcpPacket`: size-prefixed packets on an authenticated stream
//! - `FieldLayout`: per-hardware field widths used to validate record data
//! - `encode_live`/`encode_sample`: delta encoding against earlier records
//!
//! Narrow wire integers are wrapped in range-checked newtypes so invalid
//! values are rejected at construction, not at encode time.

mod delta;
mod fields;
mod packet;
mod record;
mod sequence;
mod tcp;
mod udp;
mod validation;

pub use delta::*;
pub use fields::*;
pub use packet::*;
pub use record::*;
pub use sequence::*;
pub use tcp::*;
pub use udp::*;
pub use validation::*;
