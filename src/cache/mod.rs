pub mod index;
pub mod store;

pub use index::{NAMESPACE_INDEX, label_index, namespace_index, owner_uid_index};
pub use store::{IndexFunc, Store, meta_namespace_key, object_key};
