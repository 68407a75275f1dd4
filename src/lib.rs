pub mod mpmc;

pub use mpmc::BlockQueue;
pub use mpmc::BoundedQueue;
pub use mpmc::BoundedStack;
pub use mpmc::NotifyingContainer;
pub use mpmc::{ContainerEvent, ContainerObserver, ContainerSubject};

/// Common interface for all containers.
pub trait MpmcContainer<T: Send>: Send + Sync + 'static {
    /// Error on push when the container is full.
    type PushError;
    /// Error on pop when the container is empty.
    type PopError;

    fn push(&self, item: T) -> Result<(), Self::PushError>;
    fn pop(&self) -> Result<T, Self::PopError>;

    /// True when a subsequent `push` *may* succeed without blocking.
    fn available(&self) -> bool;
    /// True when a subsequent `pop` will fail.
    fn empty(&self) -> bool;
}
