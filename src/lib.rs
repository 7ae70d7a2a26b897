#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

mod buffer;
pub mod chase_lev;
pub mod handle;
pub mod idempotent;
pub mod steal;

feature! {
    #![feature = "std"]
    pub mod reservation;

    #[doc(inline)]
    pub use reservation::ReservationCache;
}

#[doc(inline)]
pub use handle::TaskHandle;
#[doc(inline)]
pub use steal::{PushError, Steal};

pub(crate) mod loom;
