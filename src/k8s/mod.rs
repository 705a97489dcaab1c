pub mod client;
pub mod lister_watcher;

pub use lister_watcher::KubeListerWatcher;

/// Default user agent, `<package>/<version>`
///
/// Override it with the `KUBE_INFORMER_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
