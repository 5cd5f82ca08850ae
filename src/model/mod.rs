mod address;
mod key;
mod record;

pub use address::Address;
pub use key::{DnsClass, Key, RecordType};
pub use record::Record;
