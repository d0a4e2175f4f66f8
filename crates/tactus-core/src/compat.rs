//! Common synchronization and collection types used across the tactus crates.

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

pub use std::sync::{Arc, Weak};

pub use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

pub use hashbrown::{HashMap, HashSet};
