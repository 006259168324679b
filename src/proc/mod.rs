//! Child-process plumbing used by hooks, discovery, and reqsync.

pub mod child;

pub use child::ChildProcess;
