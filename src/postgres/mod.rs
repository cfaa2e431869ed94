pub mod connection;
pub mod decoder;
pub mod lsn;
pub mod schema;


pub use connection::{ReplicationConnection, ReplicationStream, SystemInfo};
pub use decoder::{LogicalMessage, ReplicationFrame, Tuple, TupleData};
pub use lsn::Lsn;
pub use schema::{ForeignKey, Schema, Table};
