mod refptr;

pub mod block_queue;
pub mod bounded_queue;
pub mod bounded_stack;
pub mod notify;

pub use block_queue::BlockQueue;
pub use bounded_queue::BoundedQueue;
pub use bounded_stack::BoundedStack;
pub use notify::{ContainerEvent, ContainerObserver, ContainerSubject, NotifyingContainer};
