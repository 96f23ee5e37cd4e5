#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

extern crate alloc;

#[macro_use]
pub(crate) mod util;
pub(crate) mod loom;

pub mod scheduler;
pub mod task;

#[doc(inline)]
pub use self::scheduler::{Schedule, Scheduler, Tick};
#[doc(inline)]
pub use self::task::{TaskCompletionHandle, TaskHandle, TaskRef};
