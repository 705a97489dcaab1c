use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    /// An index with this name is already registered
    DuplicateIndex(String),

    /// No index with this name is registered
    UnknownIndex(String),

    /// Indices must be registered before the informer runs
    IndexAfterStart(String),

    /// `start` was called on an informer that is running
    AlreadyStarted,

    /// The informer was stopped and cannot be restarted
    InformerStopped,

    /// New informers cannot be registered once the factory started
    FactoryStarted(String),

    /// Rate limiter constructed with out of range parameters
    InvalidRateLimiter(String),

    /// `MaxOf` needs at least one limiter
    EmptyRateLimiters,

    /// The queue was shut down while the caller waited for an item
    QueueShutDown,

    /// The watch resource version is too old; a relist is required
    ResourceExpired(String),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Kube(e) => write!(fmt, "kube error: {e}"),
            Self::Infer(e) => write!(fmt, "kube config error: {e}"),
            Self::DuplicateIndex(name) => write!(fmt, "index {name:?} already registered"),
            Self::UnknownIndex(name) => write!(fmt, "index {name:?} does not exist"),
            Self::IndexAfterStart(name) => {
                write!(fmt, "cannot add index {name:?}: informer has already started")
            }
            Self::AlreadyStarted => write!(fmt, "informer already started"),
            Self::InformerStopped => write!(fmt, "informer has been stopped"),
            Self::FactoryStarted(what) => {
                write!(fmt, "cannot register informer for {what}: factory already started")
            }
            Self::InvalidRateLimiter(msg) => write!(fmt, "invalid rate limiter: {msg}"),
            Self::EmptyRateLimiters => write!(fmt, "at least one rate limiter is required"),
            Self::QueueShutDown => write!(fmt, "work queue is shutting down"),
            Self::ResourceExpired(msg) => write!(fmt, "resource version expired: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}
