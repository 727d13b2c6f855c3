//! Storage adapters: key-value cache, relational database, LDAP, and the
//! document-store UID/GID allocator.

pub mod db;
pub mod docstore;
pub mod kv;
pub mod ldap;

pub use db::RelationalStore;
pub use docstore::DocStore;
pub use kv::KvStore;
pub use ldap::LdapAdapter;
